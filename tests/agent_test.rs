mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{catalog, entries, eventually, new_log, position, within};
use dogma::{
    AgentConfig, Agent, Fault, ImportError, LifecycleError, LifecycleEventType, LifecycleState,
    RegistryError, UnitConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn agent() -> (Agent, common::Log) {
    let log = new_log();
    let config = AgentConfig::default().with_exit_when_idle(false);
    (Agent::with_config(catalog(&log), config), log)
}

#[tokio::test]
async fn test_program_plugin_scenario() {
    let (agent, _log) = agent();

    agent
        .import_unit("test.host", "p1", UnitConfig::default())
        .await
        .unwrap();
    let p1 = agent.lookup("p1").unwrap();
    assert_eq!(p1.state, LifecycleState::Running);
    assert!(p1.is_running());

    let duplicate = agent.import_unit("test.idle", "p1", UnitConfig::default()).await;
    assert_eq!(
        duplicate,
        Err(LifecycleError::Registry(RegistryError::DuplicateId {
            unit_id: "p1".to_string()
        }))
    );
    assert_eq!(agent.lookup("p1").unwrap().module_ref, "test.host");

    let plugins = p1.plugins().unwrap().clone();
    plugins
        .import_unit("test.idle", "child", UnitConfig::default())
        .await
        .unwrap();
    let child = plugins.lookup("child").unwrap();
    assert_eq!(child.path, "p1/child");
    assert!(child.is_running());

    agent.unload_unit("p1").await.unwrap();
    assert!(agent.lookup("p1").is_none());
    assert!(plugins.lookup("child").is_none());
    assert!(agent.programs().is_empty());
    assert!(child.task().unwrap().is_finished());
}

#[tokio::test]
async fn test_cascading_unload_is_post_order() {
    let (agent, log) = agent();
    agent
        .import_unit("test.host", "p1", UnitConfig::default())
        .await
        .unwrap();
    let plugins = agent.lookup("p1").unwrap().plugins().unwrap().clone();
    for i in 0..4 {
        plugins
            .import_unit("test.recorder", &format!("c{}", i), UnitConfig::default())
            .await
            .unwrap();
    }
    eventually(|| entries(&log).iter().filter(|e| e.starts_with("start:")).count() == 5).await;

    let state = agent.unload_unit("p1").await.unwrap();

    let log = entries(&log);
    let parent_exit = position(&log, "exit:p1");
    let parent_stop = position(&log, "stop:p1:0");
    for i in 0..4 {
        let child_stop = position(&log, &format!("stop:p1/c{}:0", i));
        assert!(position(&log, &format!("exit:p1/c{}", i)) < child_stop);
        assert!(child_stop < parent_exit);
    }
    assert!(parent_exit < parent_stop);
    assert_eq!(state.plugins.len(), 4);
    assert_eq!(state.data, json!({ "generation": 1 }));
}

#[tokio::test]
async fn test_unresolvable_module() {
    let (agent, _log) = agent();

    let result = agent
        .import_unit("test.nowhere", "p1", UnitConfig::default())
        .await;
    assert_eq!(
        result,
        Err(LifecycleError::Import(ImportError::UnknownModule {
            module_ref: "test.nowhere".to_string()
        }))
    );
    assert!(agent.programs().is_empty());
    assert!(agent.programs().is_idle());
}

#[tokio::test]
async fn test_configure_failure_leaves_no_entry() {
    let (agent, _log) = agent();

    let result = agent
        .import_unit("test.bad_config", "p1", UnitConfig::default())
        .await;
    assert!(matches!(
        result,
        Err(LifecycleError::Import(ImportError::Configure { .. }))
    ));
    assert!(agent.lookup("p1").is_none());
}

#[tokio::test]
async fn test_stubborn_unit_is_forced() {
    let (agent, _log) = agent();
    agent
        .import_unit("test.stubborn", "slow", UnitConfig::default())
        .await
        .unwrap();
    agent
        .import_unit("test.idle", "neighbour", UnitConfig::default())
        .await
        .unwrap();
    let slow = agent.lookup("slow").unwrap();

    let grace = Duration::from_millis(100);
    let started = Instant::now();
    agent.unload_unit_with_grace("slow", grace).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= grace);
    assert!(elapsed < grace + Duration::from_millis(900));
    assert!(agent.lookup("slow").is_none());
    assert!(slow.task().unwrap().is_finished());

    let faults = agent.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(
        faults[0].fault,
        Fault::ForcedTermination {
            unit_id: "slow".to_string(),
            grace_ms: 100
        }
    );
    assert!(agent.lookup("neighbour").unwrap().is_running());
}

#[tokio::test]
async fn test_failing_units_are_reaped() {
    let (agent, _log) = agent();
    let mut events = agent.subscribe();
    agent
        .import_unit("test.idle", "steady", UnitConfig::default())
        .await
        .unwrap();
    agent
        .import_unit("test.crashing", "crash", UnitConfig::default())
        .await
        .unwrap();
    agent
        .import_unit("test.panicking", "panic", UnitConfig::default())
        .await
        .unwrap();

    eventually(|| agent.programs().len() == 1).await;
    assert!(agent.lookup("steady").unwrap().is_running());

    let mut faults: Vec<Fault> = agent.faults().into_iter().map(|r| r.fault).collect();
    faults.sort_by(|a, b| a.unit_id().cmp(b.unit_id()));
    assert_eq!(
        faults,
        vec![
            Fault::Failed {
                unit_id: "crash".to_string(),
                message: "boom".to_string()
            },
            Fault::Panicked {
                unit_id: "panic".to_string(),
                message: "lost invariant".to_string()
            },
        ]
    );

    let mut faulted = Vec::new();
    while faulted.len() < 2 {
        let event = events.recv().await.unwrap();
        if event.event_type == LifecycleEventType::UnitFaulted {
            faulted.push(event.path);
        }
    }
    faulted.sort();
    assert_eq!(faulted, vec!["crash", "panic"]);
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let (agent, _log) = agent();
    let mut events = agent.subscribe();

    agent
        .import_unit("test.idle", "p1", UnitConfig::default())
        .await
        .unwrap();
    agent.unload_unit("p1").await.unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&LifecycleEventType::UnitUnloaded) {
        let event = events.recv().await.unwrap();
        assert_eq!(event.path, "p1");
        seen.push(event.event_type);
    }
    assert_eq!(
        seen,
        vec![
            LifecycleEventType::UnitLoading,
            LifecycleEventType::UnitStarted,
            LifecycleEventType::UnitStopping,
            LifecycleEventType::UnitUnloaded,
        ]
    );
}

#[tokio::test]
async fn test_init_returns_once_root_is_empty() {
    let log = new_log();
    let agent = Arc::new(Agent::new(catalog(&log)));
    agent
        .import_unit("test.idle", "p1", UnitConfig::default())
        .await
        .unwrap();

    let running = agent.clone();
    let init = tokio::spawn(async move { running.init().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!init.is_finished());

    agent.unload_unit("p1").await.unwrap();
    within(Duration::from_secs(1), init).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_unloads_everything() {
    let (agent, log) = agent();
    let agent = Arc::new(agent);
    agent
        .import_unit("test.host", "p1", UnitConfig::default())
        .await
        .unwrap();
    agent
        .lookup("p1")
        .unwrap()
        .plugins()
        .unwrap()
        .import_unit("test.recorder", "child", UnitConfig::default())
        .await
        .unwrap();

    let running = agent.clone();
    let init = tokio::spawn(async move { running.init().await });
    eventually(|| entries(&log).len() == 4).await;

    agent.shutdown();
    within(Duration::from_secs(2), init).await.unwrap().unwrap();

    assert!(agent.programs().is_empty());
    let log = entries(&log);
    assert!(position(&log, "stop:p1/child:0") < position(&log, "stop:p1:0"));

    let late = agent.import_unit("test.idle", "late", UnitConfig::default()).await;
    assert!(matches!(late, Err(LifecycleError::ContainerClosed { .. })));
}

#[tokio::test]
async fn test_reload_hands_over_state() {
    let (agent, log) = agent();
    agent
        .import_unit("test.recorder", "p1", UnitConfig::new(json!({ "v": 1 })))
        .await
        .unwrap();

    agent
        .reload_unit("p1", Some(UnitConfig::new(json!({ "v": 2 }))))
        .await
        .unwrap();

    let p1 = agent.lookup("p1").unwrap();
    assert!(p1.is_running());
    assert_eq!(p1.config.as_value(), &json!({ "v": 2 }));
    assert!(entries(&log).contains(&"configure:p1:2".to_string()));

    let missing = agent.reload_unit("nope", None).await;
    assert_eq!(
        missing,
        Err(LifecycleError::Registry(RegistryError::NotFound {
            unit_id: "nope".to_string()
        }))
    );
}

#[tokio::test]
async fn test_relatives_and_propagation() {
    let (agent, log) = agent();
    agent
        .import_unit("test.host", "p1", UnitConfig::default())
        .await
        .unwrap();
    agent
        .import_unit("test.idle", "p2", UnitConfig::default())
        .await
        .unwrap();
    let plugins = agent.lookup("p1").unwrap().plugins().unwrap().clone();
    plugins
        .import_unit("test.probe", "probe", UnitConfig::default())
        .await
        .unwrap();
    plugins
        .import_unit("test.idle", "peer", UnitConfig::default())
        .await
        .unwrap();

    let delivered = agent.propagate("probe", &Value::Null).await;
    assert_eq!(delivered, 4);
    assert!(entries(&log).contains(&"sibling=true uncle=true not_uncle=false agent=2".to_string()));
}

#[tokio::test]
async fn test_unload_unknown_id() {
    let (agent, _log) = agent();
    let result = agent.unload_unit("ghost").await;
    assert_eq!(
        result,
        Err(LifecycleError::Registry(RegistryError::NotFound {
            unit_id: "ghost".to_string()
        }))
    );
}

#[tokio::test]
async fn test_unit_unloads_itself_without_waiting_out_grace() {
    let (agent, _log) = agent();
    let started = Instant::now();
    agent
        .import_unit("test.host", "p1", UnitConfig::default())
        .await
        .unwrap();
    agent
        .import_unit("test.self_unload", "quitter", UnitConfig::default())
        .await
        .unwrap();
    let plugins = agent.lookup("p1").unwrap().plugins().unwrap().clone();
    plugins
        .import_unit("test.self_unload", "quitter", UnitConfig::default())
        .await
        .unwrap();

    eventually(|| agent.lookup("quitter").is_none() && plugins.is_empty()).await;
    // Far below the five second default grace period.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(agent.faults().is_empty());
    assert!(plugins.faults().is_empty());
    assert!(agent.lookup("p1").unwrap().is_running());
}

#[tokio::test]
async fn test_crashing_host_takes_only_its_plugins_down() {
    let (agent, _log) = agent();
    agent
        .import_unit("test.crashing_host", "h", UnitConfig::default())
        .await
        .unwrap();
    agent
        .import_unit("test.idle", "sib", UnitConfig::default())
        .await
        .unwrap();
    let kids = agent.lookup("h").unwrap().plugins().unwrap().clone();
    let kid = kids.lookup("kid").unwrap();
    assert!(kid.is_running());

    eventually(|| agent.lookup("h").is_none()).await;
    assert!(kid.task().unwrap().is_finished());
    assert!(kids.is_empty());
    assert!(agent.lookup("sib").unwrap().is_running());

    let faults: Vec<Fault> = agent.faults().into_iter().map(|r| r.fault).collect();
    assert_eq!(
        faults,
        vec![Fault::Failed {
            unit_id: "h".to_string(),
            message: "crash".to_string()
        }]
    );
    assert!(kids.faults().is_empty());
}

#[tokio::test]
async fn test_concurrent_unloads_share_the_state() {
    let (agent, _log) = agent();
    agent
        .import_unit("test.recorder", "p1", UnitConfig::default())
        .await
        .unwrap();

    let (first, second) = tokio::join!(agent.unload_unit("p1"), agent.unload_unit("p1"));
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.data, json!({ "generation": 1 }));
    assert_eq!(second, first);
    assert!(agent.lookup("p1").is_none());
}

#[tokio::test]
async fn test_unload_waits_for_loading_unit() {
    let (agent, _log) = agent();

    let (imported, unloaded) = tokio::join!(
        agent.import_unit("test.slow_config", "slow", UnitConfig::default()),
        async {
            eventually(|| agent.lookup("slow").is_some()).await;
            assert_eq!(agent.lookup("slow").unwrap().state, LifecycleState::Loading);
            agent.unload_unit("slow").await
        }
    );
    imported.unwrap();
    unloaded.unwrap();
    assert!(agent.lookup("slow").is_none());
    assert!(agent.faults().is_empty());
}

#[tokio::test]
async fn test_unload_of_failed_import_is_not_found() {
    let (agent, _log) = agent();

    let (imported, unloaded) = tokio::join!(
        agent.import_unit("test.slow_config", "slow", UnitConfig::new(json!({ "fail": true }))),
        async {
            eventually(|| agent.lookup("slow").is_some()).await;
            agent.unload_unit("slow").await
        }
    );
    assert!(matches!(
        imported,
        Err(LifecycleError::Import(ImportError::Configure { .. }))
    ));
    assert_eq!(
        unloaded,
        Err(LifecycleError::Registry(RegistryError::NotFound {
            unit_id: "slow".to_string()
        }))
    );
    assert!(agent.programs().is_empty());
}
