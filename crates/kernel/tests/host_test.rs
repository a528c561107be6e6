//! Integration tests for the plugin host.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p plughost-kernel --test host_test
//! ```
//!
//! ## Test Coverage
//!
//! - Dependency ordering, failure propagation, and cycles
//! - Handshake timeouts and late connections
//! - Hot reload keeping instance identity
//! - Unload idempotence and unload during connection
//! - Restoring installed plugins with digest verification
//! - Tag selection
//! - Service registration by the host and by plugins
//! - Repositories, workspaces, engines, and per-plugin settings

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};

use common::{TestHost, echo_api, plugin_url, wait_for_event};
use plughost_kernel::host::{HostConfig, HostEvent, LifecycleState, RepositoryEntry};
use plughost_kernel::plugin::{ParseOverrides, PluginDescriptor, PluginError, parse};
use plughost_kernel::sandbox::{PluginApi, capability};
use plughost_kernel::service::ServiceConfig;
use plughost_kernel::store::DocumentStore;
use plughost_test_utils::{manifest_entry, manifest_json, plugin_source};

fn filter(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// -------------------------------------------------------------------------
// Dependencies
// -------------------------------------------------------------------------

#[tokio::test]
async fn dependencies_load_left_to_right_before_the_plugin() {
    let th = TestHost::new();
    let a = th.serve(&plugin_source("A", "web-worker"));
    let b = th.serve(&plugin_source("B", "web-worker"));
    let c = th.serve(&plugin_source("C", "web-worker").with_dependencies(&[&a, &b]));

    let instance = th.host.load_from_reference(&c, None).await.unwrap().unwrap();

    assert_eq!(instance.name(), "C");
    assert_eq!(th.instantiated(), vec!["A", "B", "C"]);
    for name in ["A", "B", "C"] {
        assert_eq!(th.host.instance(name).unwrap().state(), LifecycleState::Ready);
    }
}

#[tokio::test]
async fn failed_dependency_skips_the_rest() {
    let th = TestHost::new();
    th.transport.register("A", |_, _| Err("worker crashed".to_string()));
    let a = th.serve(&plugin_source("A", "web-worker"));
    let b = th.serve(&plugin_source("B", "web-worker"));
    let c = th.serve(&plugin_source("C", "web-worker").with_dependencies(&[&a, &b]));

    let err = th.host.load_from_reference(&c, None).await.unwrap_err();

    assert!(
        matches!(&err, PluginError::DependencyLoadFailed { plugin, dependency, .. } if plugin == "C" && *dependency == a),
        "unexpected error: {err}"
    );
    assert_eq!(th.instantiated(), vec!["A"]);
    assert!(th.host.instance("B").is_none());
    assert!(th.host.instance("C").is_none());
}

#[tokio::test]
async fn dependency_cycles_are_rejected() {
    let th = TestHost::new();
    let a = plugin_url("A");
    let b = plugin_url("B");
    th.serve(&plugin_source("A", "web-worker").with_dependencies(&[&b]));
    th.serve(&plugin_source("B", "web-worker").with_dependencies(&[&a]));

    let err = th.host.load_from_reference(&a, None).await.unwrap_err();

    assert!(err.to_string().contains("dependency cycle detected"), "{err}");
    assert!(th.instantiated().is_empty());
}

#[tokio::test]
async fn running_dependencies_are_not_reloaded() {
    let th = TestHost::new();
    let a = th.serve(&plugin_source("A", "web-worker"));
    let b = th.serve(&plugin_source("B", "web-worker").with_dependencies(&[&a]));

    let first = th.host.load_from_reference(&a, None).await.unwrap().unwrap();
    th.host.load_from_reference(&b, None).await.unwrap();

    assert_eq!(th.instantiated(), vec!["A", "B"]);
    assert_eq!(th.host.instance("A").unwrap().id(), first.id());
}

#[tokio::test]
async fn collections_only_load_their_dependencies() {
    let th = TestHost::new();
    let a = th.serve(&plugin_source("A", "web-worker"));
    let set = th.serve(&plugin_source("Set", "collection").with_dependencies(&[&a]));

    let loaded = th.host.load_from_reference(&set, None).await.unwrap();

    assert!(loaded.is_none());
    assert!(th.host.instance("A").is_some());
    assert!(th.host.instance("Set").is_none());
}

// -------------------------------------------------------------------------
// Connection
// -------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn handshake_timeout_keeps_waiting_in_background() {
    let th = TestHost::with_config(HostConfig {
        worker_handshake: Duration::from_secs(30),
        default_repositories: Vec::new(),
        ..HostConfig::default()
    });
    th.transport.register_silent("Slow");
    let url = th.serve(&plugin_source("Slow", "web-worker"));
    let mut events = th.host.subscribe();

    let instance = th.host.load_from_reference(&url, None).await.unwrap().unwrap();
    assert_eq!(instance.state(), LifecycleState::Connecting);
    assert!(!instance.is_initializing());
    assert!(
        instance
            .log_history()
            .iter()
            .any(|entry| entry.message.contains("within 30s"))
    );

    assert!(th.transport.release("Slow", echo_api()));
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, HostEvent::PluginLoaded { name, .. } if name == "Slow")
    })
    .await;

    assert_eq!(instance.state(), LifecycleState::Ready);
    assert!(th.host.registry().operation("Slow").is_some());
}

#[tokio::test]
async fn unload_while_connecting_aborts_the_load() {
    let th = TestHost::new();
    th.transport.register_silent("Late");
    let url = th.serve(&plugin_source("Late", "web-worker"));

    let host = th.host.clone();
    let load = tokio::spawn(async move { host.load_from_reference(&url, None).await });
    while th
        .host
        .instance("Late")
        .is_none_or(|i| i.state() != LifecycleState::Connecting)
    {
        tokio::task::yield_now().await;
    }

    th.host.unload_plugin("Late").await;
    assert!(th.transport.release("Late", echo_api()));
    let err = load.await.unwrap().unwrap_err();

    assert!(matches!(err, PluginError::LoadAborted { ref plugin } if plugin == "Late"));
    assert!(th.host.instance("Late").is_none());
    assert!(th.host.registry().operation("Late").is_none());
    assert_eq!(th.transport.terminated("Late"), 1);
}

#[tokio::test]
async fn setup_failure_tears_the_instance_down() {
    let th = TestHost::new();
    th.transport.register("Bad", |_, _| {
        Ok(PluginApi::new().with(
            "setup",
            capability(|_| async { Err(anyhow::anyhow!("setup exploded")) }),
        ))
    });
    let url = th.serve(&plugin_source("Bad", "web-worker"));

    let err = th.host.load_from_reference(&url, None).await.unwrap_err();

    assert!(
        matches!(&err, PluginError::SetupFailed { plugin, message } if plugin == "Bad" && message.contains("setup exploded")),
        "unexpected error: {err}"
    );
    assert!(th.host.instance("Bad").is_none());
    assert!(th.host.registry().operation("Bad").is_none());
    assert_eq!(th.transport.terminated("Bad"), 1);
}

#[tokio::test]
async fn resumed_plugins_call_resume_instead_of_setup() {
    let th = TestHost::new();
    th.transport.register("Back", |_, _| {
        Ok(PluginApi::new()
            .with("setup", capability(|_| async { Err(anyhow::anyhow!("setup must not run")) }))
            .with("resume", capability(|_| async { Ok(Value::Null) })))
    });
    let url = th.serve(&plugin_source("Back", "web-worker").with_field("resumed", json!(true)));

    let instance = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    assert_eq!(instance.state(), LifecycleState::Ready);
    assert!(
        instance
            .log_history()
            .iter()
            .any(|entry| entry.message == "Resuming plugin.")
    );
}

// -------------------------------------------------------------------------
// Reload and unload
// -------------------------------------------------------------------------

#[tokio::test]
async fn hot_reload_keeps_identity() {
    let th = TestHost::new();
    th.transport.register("Live", |_, _| Ok(echo_api()));
    let url = th.serve(&plugin_source("Live", "web-worker").with_script("// v1"));
    let first = th.host.load_from_reference(&url, None).await.unwrap().unwrap();
    let api = Arc::clone(first.api());

    let v2 = plugin_source("Live", "web-worker").with_script("// v2").build();
    let overrides = ParseOverrides {
        hot_reloading: true,
        ..ParseOverrides::default()
    };
    let second = th
        .host
        .reload_plugin(parse(&v2, &overrides).unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(second.id(), first.id());
    assert!(Arc::ptr_eq(second.api(), &api));
    assert_eq!(th.transport.hot_reloads("Live"), 1);
    assert_eq!(th.instantiated(), vec!["Live"]);
    assert!(second.config().script.unwrap().contains("// v2"));
    assert!(api.has_capability("run"));
}

fn hot(source: &str) -> PluginDescriptor {
    let overrides = ParseOverrides {
        hot_reloading: true,
        ..ParseOverrides::default()
    };
    parse(source, &overrides).unwrap()
}

#[tokio::test]
async fn hot_reload_runs_setup_again() {
    let th = TestHost::new();
    let setups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&setups);
    th.transport.register("Counted", move |_, _| {
        let counter = Arc::clone(&counter);
        Ok(PluginApi::new().with(
            "setup",
            capability(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        ))
    });
    let url = th.serve(&plugin_source("Counted", "web-worker").with_script("// v1"));
    let first = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    let v2 = plugin_source("Counted", "web-worker").with_script("// v2").build();
    let second = th.host.reload_plugin(hot(&v2)).await.unwrap().unwrap();

    assert_eq!(second.id(), first.id());
    assert_eq!(th.transport.hot_reloads("Counted"), 1);
    assert_eq!(setups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_setup_after_hot_reload_falls_back_to_a_fresh_load() {
    let th = TestHost::new();
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    th.transport.register("Flaky", move |_, _| {
        // The second program run is the hot reload.
        let fail = counter.fetch_add(1, Ordering::SeqCst) == 1;
        Ok(PluginApi::new().with(
            "setup",
            capability(move |_| async move {
                if fail {
                    Err(anyhow::anyhow!("cannot set up twice"))
                } else {
                    Ok(Value::Null)
                }
            }),
        ))
    });
    let url = th.serve(&plugin_source("Flaky", "web-worker").with_script("// v1"));
    let first = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    let v2 = plugin_source("Flaky", "web-worker").with_script("// v2").build();
    let second = th.host.reload_plugin(hot(&v2)).await.unwrap().unwrap();

    assert_ne!(second.id(), first.id());
    assert!(first.is_unloaded());
    assert_eq!(second.state(), LifecycleState::Ready);
    assert_eq!(th.instantiated(), vec!["Flaky", "Flaky"]);
}

#[tokio::test]
async fn iframe_plugins_hot_reload_in_place() {
    let th = TestHost::new();
    th.transport.register("Frame", |_, _| Ok(echo_api()));
    let url = th.serve(&plugin_source("Frame", "iframe").with_script("// v1"));
    let first = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    let v2 = plugin_source("Frame", "iframe").with_script("// v2").build();
    let second = th.host.reload_plugin(hot(&v2)).await.unwrap().unwrap();

    assert_eq!(second.id(), first.id());
    assert_eq!(th.transport.hot_reloads("Frame"), 1);
    assert_eq!(th.instantiated(), vec!["Frame"]);
}

#[tokio::test]
async fn hot_reload_reaches_running_dependencies_and_keeps_their_tag() {
    let th = TestHost::new();
    th.transport.register("Lib", |_, _| Ok(echo_api()));
    th.transport.register("App", |_, _| Ok(echo_api()));
    let lib_url = th.serve(
        &plugin_source("Lib", "web-worker")
            .with_tags(&["stable", "dev"])
            .with_tagged_script("stable", "// stable lib")
            .with_tagged_script("dev", "// dev lib"),
    );
    let lib = th
        .host
        .load_from_reference(&lib_url, Some("dev".into()))
        .await
        .unwrap()
        .unwrap();
    let app_source = plugin_source("App", "web-worker").with_dependencies(&[lib_url.as_str()]);
    let app_url = th.serve(&app_source);
    th.host.load_from_reference(&app_url, None).await.unwrap();
    assert_eq!(th.transport.hot_reloads("Lib"), 0);

    th.host.reload_plugin(hot(&app_source.build())).await.unwrap();

    let reloaded = th.host.instance("Lib").unwrap();
    assert_eq!(reloaded.id(), lib.id());
    assert_eq!(th.transport.hot_reloads("Lib"), 1);
    assert_eq!(reloaded.config().tag.as_deref(), Some("dev"));
    assert!(reloaded.config().script.unwrap().contains("// dev lib"));
}

#[tokio::test]
async fn reload_without_hot_reloading_replaces_the_instance() {
    let th = TestHost::new();
    let url = th.serve(&plugin_source("Cold", "web-worker"));
    let first = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    let second = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    assert_ne!(second.id(), first.id());
    assert!(first.is_unloaded());
    assert_eq!(th.transport.terminated("Cold"), 1);
    assert_eq!(th.host.instances().len(), 1);
}

#[tokio::test]
async fn unloading_twice_is_a_noop() {
    let th = TestHost::new();
    th.transport.register("A", |_, _| Ok(echo_api()));
    let url = th.serve(&plugin_source("A", "web-worker"));
    let instance = th.host.load_from_reference(&url, None).await.unwrap().unwrap();
    assert!(th.host.registry().operation("A").is_some());

    th.host.unload(&instance).await;
    th.host.unload(&instance).await;

    assert_eq!(th.transport.terminated("A"), 1);
    assert!(th.host.instance("A").is_none());
    assert!(th.host.registry().operation("A").is_none());
    assert_eq!(instance.state(), LifecycleState::Terminated);
}

// -------------------------------------------------------------------------
// Installed plugins
// -------------------------------------------------------------------------

#[tokio::test]
async fn restore_skips_plugins_whose_source_was_altered() {
    let th = TestHost::new();
    let a = th.serve(&plugin_source("A", "web-worker"));
    let b = th.serve(&plugin_source("B", "web-worker"));
    th.host.install_plugin(&a, None, true).await.unwrap();
    th.host.install_plugin(&b, None, true).await.unwrap();

    let store = th.stores.store("default_workspace").unwrap();
    let mut doc = store.get("A").await.unwrap();
    let tampered = doc.field("code").and_then(Value::as_str).unwrap().replace("setup", "steal");
    doc.body.insert("code".into(), json!(tampered));
    store.put(doc).await.unwrap();

    let report = th.host.reload_plugins().await.unwrap();

    assert_eq!(report.loaded, vec!["B"]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].error,
        PluginError::ContentHashMismatch { ref plugin, .. } if plugin == "A"
    ));
    assert_eq!(th.instantiated(), vec!["B"]);
    assert!(th.host.registry().operation("A").is_none());

    let installed = th.host.installed_plugins().await.unwrap();
    assert_eq!(installed.len(), 2);
    assert!(!installed[0].verified);
    assert!(installed[1].verified);
}

#[tokio::test]
async fn install_stores_dependencies_and_removal_unloads() {
    let th = TestHost::new();
    let dep = th.serve(&plugin_source("Dep", "web-worker"));
    let main = th.serve(&plugin_source("Main", "web-worker").with_dependencies(&[&dep]));

    th.host.install_plugin(&main, None, false).await.unwrap();
    let names: Vec<String> = th
        .host
        .installed_plugins()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["Dep", "Main"]);
    assert!(th.host.instance("Main").is_some());

    th.host.remove_plugin("Main").await.unwrap();
    assert!(th.host.instance("Main").is_none());
    assert!(th.host.get_installed_source("Main").await.unwrap().is_none());
}

// -------------------------------------------------------------------------
// Tags
// -------------------------------------------------------------------------

#[tokio::test]
async fn reference_tag_selects_the_script() {
    let th = TestHost::new();
    let url = th.serve(
        &plugin_source("Tagged", "web-worker")
            .with_tags(&["stable", "dev"])
            .with_tagged_script("stable", "// stable build")
            .with_tagged_script("dev", "// dev build"),
    );

    let instance = th
        .host
        .load_from_reference(&format!("{url}@dev"), None)
        .await
        .unwrap()
        .unwrap();

    let config = instance.config();
    assert_eq!(config.tag.as_deref(), Some("dev"));
    assert!(config.script.unwrap().contains("// dev build"));
    assert_eq!(th.transport.stats().handshakes[0]["TAG"], "dev");
}

#[tokio::test]
async fn first_declared_tag_is_the_default() {
    let th = TestHost::new();
    let url = th.serve(
        &plugin_source("Tagged", "web-worker")
            .with_tags(&["stable", "dev"])
            .with_tagged_script("stable", "// stable build")
            .with_tagged_script("dev", "// dev build"),
    );

    let instance = th.host.load_from_reference(&url, None).await.unwrap().unwrap();

    assert_eq!(instance.config().tag.as_deref(), Some("stable"));
    assert!(instance.config().script.unwrap().contains("// stable build"));
}

// -------------------------------------------------------------------------
// Services
// -------------------------------------------------------------------------

#[tokio::test]
async fn host_registrations_check_identity_and_type() {
    let th = TestHost::new();

    let id = th
        .host
        .register_service(None, ServiceConfig::from_json(json!({ "type": "#custom", "name": "thing" })))
        .await
        .unwrap();
    let found = th.host.get_services(&filter(json!({ "type": "#custom" })));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);

    let err = th
        .host
        .register_service(None, ServiceConfig::from_json(json!({ "type": "mystery", "name": "x" })))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::UnnamespacedUnknownServiceType { .. }));

    let err = th
        .host
        .register_service(None, ServiceConfig::from_json(json!({ "type": "#custom" })))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::MissingServiceIdentity { .. }));
}

#[tokio::test]
async fn plugin_services_go_away_on_unload() {
    let th = TestHost::new();
    th.transport.register("Svc", |_, interface| {
        let context = interface.context.clone();
        Ok(echo_api().with(
            "setup",
            capability(move |_| {
                let context = context.clone();
                async move {
                    context
                        .register_service(ServiceConfig::from_json(
                            json!({ "type": "#thing", "name": "thing" }),
                        ))
                        .await?;
                    Ok(Value::Null)
                }
            }),
        ))
    });
    let url = th.serve(&plugin_source("Svc", "web-worker"));
    th.host.load_from_reference(&url, None).await.unwrap();

    let things = th.host.get_services(&filter(json!({ "type": "#thing" })));
    assert_eq!(things.len(), 1);
    assert_eq!(things[0].provider, "Svc");

    let echoed = th.host.registry().execute("Svc", json!({ "x": 1 })).await.unwrap();
    assert_eq!(echoed, json!({ "x": 1 }));

    th.host.unload_plugin("Svc").await;
    assert!(th.host.get_services(&filter(json!({ "type": "#thing" }))).is_empty());
    assert!(th.host.registry().operation("Svc").is_none());
}

#[tokio::test]
async fn non_runnable_plugins_register_no_operation() {
    let th = TestHost::new();
    let url = th.serve(&plugin_source("Lib", "web-worker").not_runnable());

    th.host.load_from_reference(&url, None).await.unwrap();

    assert!(th.host.instance("Lib").is_some());
    assert!(th.host.registry().operation("Lib").is_none());
}

#[tokio::test]
async fn engine_service_places_orphaned_plugins() {
    let th = TestHost::new();
    let url = th.serve(&plugin_source("Py", "native-python"));

    let err = th.host.load_from_reference(&url, None).await.unwrap_err();
    assert!(matches!(err, PluginError::SandboxFailed { .. }));

    th.host
        .register_service(
            None,
            ServiceConfig::from_json(json!({
                "type": "engine",
                "name": "local",
                "url": "http://localhost:9527"
            })),
        )
        .await
        .unwrap();

    let instance = th.host.instance("Py").unwrap();
    assert_eq!(instance.engine(), Some("http://localhost:9527"));

    th.host.unregister_service(None, None).await;
    assert!(th.host.instance("Py").is_none());
    assert!(th.host.engines().iter().all(|e| !e.connected));
}

// -------------------------------------------------------------------------
// Repositories, workspaces, settings
// -------------------------------------------------------------------------

#[tokio::test]
async fn bare_names_resolve_in_the_loaded_repository() {
    let th = TestHost::new();
    let manifest_url = format!("{}/manifest.imjoy.json", common::BASE);
    th.fetcher.insert(
        manifest_url.clone(),
        manifest_json(
            "Test Repo",
            common::BASE,
            &[manifest_entry("A", "A.imjoy.html")],
        ),
    );
    th.serve(&plugin_source("A", "web-worker"));

    let entry = th
        .host
        .add_repository(RepositoryEntry::from_shorthand(&manifest_url))
        .await
        .unwrap();
    assert_eq!(entry.name, "Test Repo");
    assert_eq!(th.host.repositories().len(), 1);

    let manifest = th.host.reload_repository(&entry).await.unwrap();
    assert!(!manifest.plugins[0].installed);

    let instance = th.host.load_from_reference("A", None).await.unwrap().unwrap();
    assert_eq!(instance.config().uri.as_deref(), Some(plugin_url("A").as_str()));

    assert!(th.host.remove_repository("Test Repo").await.unwrap());
    assert!(th.host.repositories().is_empty());
}

#[tokio::test]
async fn switching_workspace_swaps_installed_plugins() {
    let th = TestHost::new();
    let a = th.serve(&plugin_source("A", "web-worker"));
    th.host.install_plugin(&a, None, false).await.unwrap();
    assert_eq!(th.host.load_workspace_list().await.unwrap(), vec!["default"]);

    let report = th.host.load_workspace("lab").await.unwrap();

    assert!(report.loaded.is_empty());
    assert_eq!(th.host.workspace(), "lab");
    assert_eq!(th.host.workspaces(), vec!["default", "lab"]);
    assert!(th.host.instance("A").is_none());
    assert!(th.host.installed_plugins().await.unwrap().is_empty());

    th.host.load_workspace("default").await.unwrap();
    assert!(th.host.instance("A").is_some());
}

#[tokio::test]
async fn plugin_settings_round_trip_and_readonly_fields() {
    let th = TestHost::new();
    let url = th.serve(&plugin_source("A", "web-worker").with_attachment("notes", "hello"));
    th.host.load_from_reference(&url, None).await.unwrap();

    th.host.set_plugin_config("A", "color", json!("red")).await.unwrap();
    assert_eq!(
        th.host.get_plugin_config("A", "color").await.unwrap(),
        Some(json!("red"))
    );
    assert_eq!(
        th.host.get_plugin_config("A", "_name").await.unwrap(),
        Some(json!("A"))
    );
    let err = th
        .host
        .set_plugin_config("A", "_name", json!("B"))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::ReadonlyConfigField { .. }));

    assert_eq!(th.host.get_attachment("A", "notes").as_deref(), Some("hello"));
}

#[tokio::test]
async fn run_plugin_calls_the_exported_run() {
    let th = TestHost::new();
    th.transport.register("Echo", |_, _| Ok(echo_api()));
    let url = th.serve(&plugin_source("Echo", "web-worker"));
    th.host.load_from_reference(&url, None).await.unwrap();

    let my = json!({ "data": 3, "config": {} });
    assert_eq!(th.host.run_plugin("Echo", my.clone()).await.unwrap(), my);

    let err = th
        .host
        .call_plugin("Echo", "missing", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::CapabilityMissing { .. }));
}

#[tokio::test]
async fn newer_source_at_origin_is_an_update() {
    let th = TestHost::new();
    let url = th.serve(&plugin_source("A", "web-worker").with_version("0.1.0"));
    th.host.load_from_reference(&url, None).await.unwrap();
    assert!(!th.host.check_plugin_update("A").await.unwrap());

    th.serve(&plugin_source("A", "web-worker").with_version("0.2.0"));
    let mut events = th.host.subscribe();

    assert_eq!(th.host.check_updates().await, vec!["A"]);
    wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, HostEvent::Message { text } if text.contains("A"))
    })
    .await;
}

#[tokio::test]
async fn destroy_unloads_every_instance() {
    let th = TestHost::new();
    let a = th.serve(&plugin_source("A", "web-worker"));
    let b = th.serve(&plugin_source("B", "web-worker"));
    th.host.load_from_reference(&a, None).await.unwrap();
    th.host.load_from_reference(&b, None).await.unwrap();
    assert_eq!(th.host.get_plugins().len(), 2);

    th.host.destroy().await;

    assert!(th.host.instances().is_empty());
    assert!(th.host.registry().is_empty());
    assert_eq!(th.transport.terminated("A"), 1);
    assert_eq!(th.transport.terminated("B"), 1);
}
