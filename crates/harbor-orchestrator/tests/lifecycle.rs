//! Orchestrator lifecycle flows that do not require a container engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use harbor_auth::{AuthManager, CredentialStore};
use harbor_core::{AgentId, SessionBinding};
use harbor_docker::SandboxDriver;
use harbor_index::{now_epoch, SandboxIndex, SandboxRecord, SandboxState};
use harbor_orchestrator::{Orchestrator, OrchestratorError, SessionConfig};
use harbor_settings::{AuthSettings, HarborSettings};

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    index: Arc<SandboxIndex>,
    _dir: TempDir,
}

fn fixture(max_sessions: usize) -> Fixture {
    let dir = TempDir::new().unwrap();

    let mut settings = HarborSettings::default();
    settings.server.data_dir = dir.path().join("data");
    settings.server.max_concurrent_sessions = max_sessions;
    settings.auth = AuthSettings {
        credential_file: Some(dir.path().join("credentials.json")),
        ..AuthSettings::default()
    };

    let driver = Arc::new(SandboxDriver::new(&settings.sandbox).expect("driver handle"));
    let index = Arc::new(SandboxIndex::open(&settings.server.data_dir).expect("index"));
    let store = Arc::new(CredentialStore::new(&settings.auth));
    let auth = Arc::new(AuthManager::new(store, settings.auth.clone()));

    let orchestrator = Orchestrator::new(settings, driver, Arc::clone(&index), auth);
    Fixture {
        orchestrator,
        index,
        _dir: dir,
    }
}

fn record(agent: &str, binding: SessionBinding) -> SandboxRecord {
    let now = now_epoch();
    SandboxRecord {
        agent_id: AgentId::new(agent),
        sandbox_id: format!("sbx-{agent}"),
        sandbox_name: AgentId::new(agent).sandbox_name(),
        workspace_path: PathBuf::from(format!("/tmp/{agent}/workspace")),
        config_path: PathBuf::from(format!("/tmp/{agent}/config")),
        model: "gpt-5-codex".into(),
        provider: "openai".into(),
        approval_mode: "suggest".into(),
        reasoning_level: "medium".into(),
        binding,
        state: SandboxState::Stopped,
        created_at: now,
        last_active: now,
        persistent_session_id: None,
    }
}

#[tokio::test]
async fn session_cap_is_enforced_before_any_engine_work() {
    let fixture = fixture(0);

    let err = fixture
        .orchestrator
        .get_or_create(&AgentId::new("a1"), SessionConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::CapExceeded { limit: 0 }));
}

#[tokio::test]
async fn detaching_a_persistent_agent_preserves_its_record() {
    let fixture = fixture(5);
    let agent = AgentId::new("keeper");

    fixture
        .index
        .register(record("keeper", SessionBinding::Persistent))
        .await
        .unwrap();

    let before = fixture.index.get(&agent).await.unwrap().last_active;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    fixture.orchestrator.detach_agent(&agent).await;

    let after = fixture.index.get(&agent).await.expect("record preserved");
    assert!(after.last_active >= before);
}

#[tokio::test]
async fn detaching_an_ephemeral_agent_drops_its_record() {
    let fixture = fixture(5);
    let agent = AgentId::new("fleeting");

    fixture
        .index
        .register(record("fleeting", SessionBinding::Ephemeral))
        .await
        .unwrap();

    // The fake sandbox id cannot be stopped or removed, but eviction from
    // the index must converge anyway.
    fixture.orchestrator.detach_agent(&agent).await;
    assert!(fixture.index.get(&agent).await.is_none());
}

#[tokio::test]
async fn remove_scrubs_the_per_agent_data_tree() {
    let fixture = fixture(5);
    let agent = AgentId::new("tenant");

    let data_dir = fixture._dir.path().join("data");
    let agent_dir = data_dir.join("agents").join("tenant");
    std::fs::create_dir_all(agent_dir.join("workspace")).unwrap();
    std::fs::write(agent_dir.join("workspace").join("notes.txt"), "hello").unwrap();

    fixture
        .index
        .register(record("tenant", SessionBinding::Persistent))
        .await
        .unwrap();

    fixture.orchestrator.remove(&agent).await.unwrap();

    assert!(fixture.index.get(&agent).await.is_none());
    assert!(!agent_dir.exists());
}

#[tokio::test]
async fn reap_reports_unremovable_agents_without_stalling() {
    let fixture = fixture(5);

    let mut idle = record("idler", SessionBinding::Persistent);
    idle.last_active = now_epoch() - 10_000;
    idle.created_at = idle.last_active;
    fixture.index.register(idle).await.unwrap();

    let report = fixture
        .orchestrator
        .reap_inactive(Duration::from_secs(3600))
        .await;

    // Whatever the engine answered for the fake sandbox, the index entry is
    // gone and the report accounts for the agent exactly once.
    assert_eq!(report.removed.len() + report.failed.len(), 1);
    assert!(fixture.index.get(&AgentId::new("idler")).await.is_none());
}

#[tokio::test]
async fn shutdown_after_shutdown_is_harmless() {
    let fixture = fixture(5);
    fixture.orchestrator.spawn_reaper();

    fixture.orchestrator.shutdown().await;
    fixture.orchestrator.shutdown().await;
}
