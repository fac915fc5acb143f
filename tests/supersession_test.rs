mod helpers;

use engram::memory::recall::RecallQuery;
use engram::memory::types::{EdgeKind, MemoryStatus};
use engram::vault::RememberOptions;
use engram::EngramError;

#[test]
fn supersession_sets_pointer_status_and_interval() {
    let vault = helpers::open_vault();
    let old = vault
        .remember("Alex works at Corp A", RememberOptions::default())
        .unwrap();
    let new = vault
        .remember("Alex moved to Corp B", RememberOptions::default())
        .unwrap();

    vault.connect(&new, &old, EdgeKind::Supersedes, 1.0).unwrap();

    let old_memory = vault.get(&old).unwrap();
    let new_memory = vault.get(&new).unwrap();
    assert_eq!(old_memory.status, MemoryStatus::Superseded);
    assert_eq!(old_memory.superseded_by.as_deref(), Some(new.as_str()));
    // valid_until ≤ successor.valid_from
    assert!(old_memory.valid_until.as_deref() <= Some(new_memory.valid_from.as_str()));
    assert_eq!(new_memory.status, MemoryStatus::Active);
}

#[test]
fn superseded_fact_does_not_outrank_successor() {
    let vault = helpers::open_vault();
    let old = vault
        .remember("Alex works at Corp A", RememberOptions::default())
        .unwrap();
    let new = vault
        .remember("Alex moved to Corp B", RememberOptions::default())
        .unwrap();
    vault.connect(&new, &old, EdgeKind::Supersedes, 1.0).unwrap();
    vault.flush().unwrap();

    let results = vault
        .recall(&RecallQuery::new("Where does Alex work?", 3))
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].memory.id, new);
    assert!(results.iter().all(|r| r.memory.id != old));
}

#[test]
fn double_supersession_conflicts() {
    let vault = helpers::open_vault();
    let old = vault.remember("version one of the plan", RememberOptions::default()).unwrap();
    let second = vault.remember("version two of the plan", RememberOptions::default()).unwrap();
    let third = vault.remember("version three of the plan", RememberOptions::default()).unwrap();

    vault.connect(&second, &old, EdgeKind::Supersedes, 1.0).unwrap();
    let err = vault
        .connect(&third, &old, EdgeKind::Supersedes, 1.0)
        .unwrap_err();
    assert!(matches!(err, EngramError::Conflict(_)));
}

#[test]
fn point_in_time_recall_travels_the_chain() {
    let vault = helpers::open_vault();
    let x = vault
        .remember("deploys use framework X", RememberOptions::default())
        .unwrap();
    let y = vault
        .remember("deploys use framework Y", RememberOptions::default())
        .unwrap();
    vault.connect(&y, &x, EdgeKind::Supersedes, 1.0).unwrap();
    vault.flush().unwrap();

    let x_memory = vault.get(&x).unwrap();
    let y_memory = vault.get(&y).unwrap();

    // An instant inside X's closed interval sees X.
    let mut historical = RecallQuery::new("framework", 3);
    historical.at = Some(x_memory.valid_from.clone());
    let results = vault.recall(&historical).unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(ids, vec![x.as_str()]);

    // An instant after the handover sees Y only.
    let mut current = RecallQuery::new("framework", 3);
    current.at = Some("2999-01-01T00:00:00+00:00".into());
    let results = vault.recall(&current).unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(ids, vec![y.as_str()]);

    // Returned memories always satisfy valid_from ≤ at < valid_until.
    assert!(y_memory.valid_until.is_none());
}

#[test]
fn archived_memories_still_resolve_historical_queries() {
    let vault = helpers::open_vault();
    let x = vault
        .remember("the team uses framework X", RememberOptions::default())
        .unwrap();
    let y = vault
        .remember("the team uses framework Y", RememberOptions::default())
        .unwrap();
    vault.connect(&y, &x, EdgeKind::Supersedes, 1.0).unwrap();
    vault.flush().unwrap();

    // Archival is a storage concern, not a truth concern.
    vault.forget(&x, false).unwrap();

    let x_memory = vault.get(&x).unwrap();
    let mut historical = RecallQuery::new("framework", 3);
    historical.at = Some(x_memory.valid_from.clone());
    let results = vault.recall(&historical).unwrap();
    assert!(results.iter().any(|r| r.memory.id == x));
}

#[test]
fn hard_forget_erases_the_chain_cleanly() {
    let vault = helpers::open_vault();
    let id = vault
        .remember("short-lived secret observation", RememberOptions::default())
        .unwrap();
    vault.flush().unwrap();
    vault.forget(&id, true).unwrap();

    let results = vault
        .recall(&RecallQuery::new("short-lived secret observation", 5))
        .unwrap();
    assert!(results.iter().all(|r| r.memory.id != id));

    // No neighbors reference it either.
    let other = vault.remember("unrelated note", RememberOptions::default()).unwrap();
    let hits = vault.neighbors(&other, 2).unwrap();
    assert!(hits.iter().all(|h| h.id != id));
}
