//! Durability behavior of the sandbox index across process boundaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use harbor_core::{AgentId, SessionBinding};
use harbor_index::{now_epoch, SandboxIndex, SandboxRecord, SandboxState, INDEX_FILE, METADATA_DIR};

fn record(agent: &str) -> SandboxRecord {
    let now = now_epoch();
    SandboxRecord {
        agent_id: AgentId::new(agent),
        sandbox_id: format!("sbx-{agent}"),
        sandbox_name: AgentId::new(agent).sandbox_name(),
        workspace_path: PathBuf::from(format!("/data/agents/{agent}/workspace")),
        config_path: PathBuf::from(format!("/data/agents/{agent}/config")),
        model: "gpt-5-codex".into(),
        provider: "openai".into(),
        approval_mode: "suggest".into(),
        reasoning_level: "medium".into(),
        binding: SessionBinding::Persistent,
        state: SandboxState::Running,
        created_at: now,
        last_active: now,
        persistent_session_id: Some(format!("persistent-{agent}")),
    }
}

#[tokio::test]
async fn a_fresh_index_over_the_same_data_dir_sees_committed_records() {
    let dir = TempDir::new().unwrap();

    {
        let index = SandboxIndex::open(dir.path()).unwrap();
        index.register(record("agent-1")).await.unwrap();
        index
            .update_state(&AgentId::new("agent-1"), SandboxState::Running)
            .await
            .unwrap();
        // Dropped without any explicit flush: every mutation is write-through.
    }

    let reborn = SandboxIndex::open(dir.path()).unwrap();
    let got = reborn.get(&AgentId::new("agent-1")).await.expect("record survived");
    assert_eq!(got.sandbox_id, "sbx-agent-1");
    assert_eq!(got.state, SandboxState::Running);
    assert_eq!(got.persistent_session_id.as_deref(), Some("persistent-agent-1"));
}

#[tokio::test]
async fn concurrent_mutations_leave_a_parseable_file() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(SandboxIndex::open(dir.path()).unwrap());

    let mut handles = Vec::new();
    for i in 0..16 {
        let index = Arc::clone(&index);
        handles.push(tokio::spawn(async move {
            let agent = format!("agent-{i}");
            index.register(record(&agent)).await.unwrap();
            index
                .update_last_active(&AgentId::new(agent.clone()))
                .await
                .unwrap();
            if i % 3 == 0 {
                index.remove(&AgentId::new(agent)).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // The on-disk file must be exactly what a reopen can parse, with the
    // removals applied.
    let reborn = SandboxIndex::open(dir.path()).unwrap();
    let all = reborn.list_all().await;
    assert_eq!(all.len(), 16 - 6);
    assert!(reborn.get(&AgentId::new("agent-0")).await.is_none());
    assert!(reborn.get(&AgentId::new("agent-1")).await.is_some());
}

#[tokio::test]
async fn idle_listing_and_stale_reaping_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let index = SandboxIndex::open(dir.path()).unwrap();
        let mut old = record("old-timer");
        old.created_at = now_epoch() - 200_000;
        old.last_active = now_epoch() - 100_000;
        index.register(old).await.unwrap();
        index.register(record("newcomer")).await.unwrap();
    }

    let reborn = SandboxIndex::open(dir.path()).unwrap();
    let idle = reborn.list_idle(Duration::from_secs(3600)).await;
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].agent_id.as_str(), "old-timer");

    let removed = reborn.reap_stale(Duration::from_secs(86_400)).await.unwrap();
    assert_eq!(removed.len(), 1);

    let third = SandboxIndex::open(dir.path()).unwrap();
    assert!(third.get(&AgentId::new("old-timer")).await.is_none());
    assert!(third.get(&AgentId::new("newcomer")).await.is_some());
}

#[tokio::test]
async fn truncated_file_is_treated_as_absent_not_fatal() {
    let dir = TempDir::new().unwrap();

    {
        let index = SandboxIndex::open(dir.path()).unwrap();
        index.register(record("agent-1")).await.unwrap();
    }

    // Simulate a torn write from a crashed process that bypassed the
    // temp-and-rename path.
    let file = dir.path().join(METADATA_DIR).join(INDEX_FILE);
    let full = std::fs::read_to_string(&file).unwrap();
    std::fs::write(&file, &full[..full.len() / 2]).unwrap();

    let reborn = SandboxIndex::open(dir.path()).unwrap();
    assert!(reborn.list_all().await.is_empty());

    // And the index keeps working afterwards.
    reborn.register(record("agent-2")).await.unwrap();
    assert!(reborn.get(&AgentId::new("agent-2")).await.is_some());
}
