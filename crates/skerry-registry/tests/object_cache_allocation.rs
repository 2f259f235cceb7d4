//! Allocation behaviour of the object registry
//!
//! TigerStyle: Deterministic shuffles (seeded registries), one property per
//! test:
//!
//! - Uniqueness: get succeeds iff the identity is registered
//! - Type index consistency: members sorted by identity, empty types reclaimed
//! - No-loss allocation: every request gets exactly one answer
//! - Release drains queues, skipping canceled requests
//! - Least-loaded preference
//! - Cascading release notifies the registry once per freed object

use skerry_core::RegistryConfig;
use skerry_registry::{
    Allocatable, AllocationReceiver, AllocationRequestRef, Identity, LoadInfo, LoadSample,
    MemoryLoadCache, MemorySession, ObjectAllocationRequest, ObjectCache, ObjectInfo,
    ObjectProxy, RegistryError, SessionRef,
};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

fn test_cache(seed: u64) -> Arc<ObjectCache> {
    test_cache_with_loads(seed, Arc::new(MemoryLoadCache::new()))
}

fn test_cache_with_loads(seed: u64, loads: Arc<MemoryLoadCache>) -> Arc<ObjectCache> {
    ObjectCache::with_config(RegistryConfig::with_seed(seed), loads).unwrap()
}

fn id(name: &str) -> Identity {
    Identity::new(name).unwrap()
}

fn direct(name: &str, type_id: &str) -> ObjectInfo {
    ObjectInfo::new(ObjectProxy::direct(id(name)), type_id).unwrap()
}

fn on_adapter(name: &str, type_id: &str, adapter: &str) -> ObjectInfo {
    ObjectInfo::new(ObjectProxy::indirect(id(name), adapter).unwrap(), type_id).unwrap()
}

fn request(session: &Arc<MemorySession>) -> (AllocationRequestRef, AllocationReceiver) {
    let (request, rx) = ObjectAllocationRequest::new(session.clone());
    (request, rx)
}

/// Name of the object delivered on the receiver
fn granted(rx: &mut AllocationReceiver) -> String {
    match rx.try_recv() {
        Ok(Ok(Some(info))) => info.identity().name().to_string(),
        other => panic!("expected an allocated object, got {:?}", other),
    }
}

fn as_session(session: &Arc<MemorySession>) -> SessionRef {
    session.clone()
}

// =============================================================================
// Membership
// =============================================================================

#[test]
fn test_uniqueness_after_remove_and_readd() {
    let cache = test_cache(1);

    cache.add(direct("svc", "::Old"), "app-1", true, None);
    cache.remove(&id("svc"));
    assert!(matches!(
        cache.get(&id("svc")),
        Err(RegistryError::ObjectNotRegistered { .. })
    ));

    cache.add(direct("svc", "::New"), "app-2", false, None);
    let entry = cache.get(&id("svc")).unwrap();
    assert_eq!(entry.type_id(), "::New");
    assert_eq!(entry.application(), "app-2");
    assert!(!cache.has_type("::Old"));
    assert!(cache.get_all_by_type("::Old").is_empty());
}

#[test]
fn test_type_index_sorted_and_consistent() {
    let cache = test_cache(2);
    for name in ["delta", "alpha", "charlie", "bravo"] {
        cache.add(direct(name, "::Worker"), "app", true, None);
    }
    cache.add(direct("echo", "::Other"), "app", true, None);
    cache.remove(&id("charlie"));

    let names: Vec<_> = cache
        .get_all_by_type("::Worker")
        .iter()
        .map(|info| info.identity().name().to_string())
        .collect();
    assert_eq!(names, vec!["alpha", "bravo", "delta"]);
    assert_eq!(cache.get_all_by_type("::Other").len(), 1);
}

#[test]
fn test_empty_type_reclaimed() {
    let cache = test_cache(3);
    cache.add(direct("w1", "::Worker"), "app", true, None);
    cache.add(direct("w2", "::Worker"), "app", true, None);

    cache.remove(&id("w1"));
    assert!(cache.has_type("::Worker"));
    cache.remove(&id("w2"));
    assert!(!cache.has_type("::Worker"));
    assert!(cache.get_all_by_type("::Worker").is_empty());

    let alice = MemorySession::new("alice");
    let (req, mut rx) = request(&alice);
    cache.allocate_by_type("::Worker", req);
    assert_eq!(rx.try_recv().unwrap(), Ok(None));
}

// =============================================================================
// Allocation by type
// =============================================================================

#[test]
fn test_allocate_by_type_exactly_one_answer() {
    let cache = test_cache(4);
    cache.add(direct("w1", "::Worker"), "app", true, None);
    cache.add(direct("w2", "::Worker"), "app", true, None);

    let alice = MemorySession::new("alice");
    let bob = MemorySession::new("bob");
    let carol = MemorySession::new("carol");
    let (r1, mut rx1) = request(&alice);
    let (r2, mut rx2) = request(&bob);
    let (r3, mut rx3) = request(&carol);
    cache.allocate_by_type("::Worker", r1);
    cache.allocate_by_type("::Worker", r2);

    let first = granted(&mut rx1);
    let second = granted(&mut rx2);
    assert_ne!(first, second);
    assert_eq!(alice.allocation_count(), 1);
    assert_eq!(bob.allocation_count(), 1);

    // Every member taken: parked
    cache.allocate_by_type("::Worker", r3.clone());
    assert!(rx3.try_recv().is_err());
    assert_eq!(cache.pending_requests("::Worker"), 1);

    // Answered out of band; the release skips it
    r3.canceled(RegistryError::AllocationCanceled);
    let entry = cache.get(&id(&first)).unwrap();
    entry.release(&as_session(&alice)).unwrap();
    assert_eq!(rx3.try_recv().unwrap(), Err(RegistryError::AllocationCanceled));
    assert_eq!(cache.pending_requests("::Worker"), 0);
    assert!(!entry.is_allocated());
    assert_eq!(carol.allocation_count(), 0);
}

#[test]
fn test_release_drains_queue_skipping_canceled() {
    let cache = test_cache(5);
    cache.add(direct("printer", "::Printer"), "app", true, None);

    let owner = MemorySession::new("owner");
    let (r0, mut rx0) = request(&owner);
    cache.allocate_by_type("::Printer", r0);
    assert_eq!(granted(&mut rx0), "printer");

    let bob = MemorySession::new("bob");
    let carol = MemorySession::new("carol");
    let dave = MemorySession::new("dave");
    let (canceled, mut rx_canceled) = ObjectAllocationRequest::new(bob.clone());
    let (r_carol, mut rx_carol) = request(&carol);
    let (r_dave, mut rx_dave) = request(&dave);
    cache.allocate_by_type("::Printer", canceled.clone());
    cache.allocate_by_type("::Printer", r_carol);
    cache.allocate_by_type("::Printer", r_dave);
    assert_eq!(cache.pending_requests("::Printer"), 3);

    assert!(canceled.cancel());
    assert_eq!(
        rx_canceled.try_recv().unwrap(),
        Err(RegistryError::AllocationCanceled)
    );

    let entry = cache.get(&id("printer")).unwrap();
    assert!(entry.release(&as_session(&owner)).unwrap());

    assert_eq!(granted(&mut rx_carol), "printer");
    assert!(rx_dave.try_recv().is_err());
    assert_eq!(cache.pending_requests("::Printer"), 1);
    assert_eq!(bob.allocation_count(), 0);
    assert_eq!(carol.allocation_count(), 1);

    assert!(entry.release(&as_session(&carol)).unwrap());
    assert_eq!(granted(&mut rx_dave), "printer");
    assert_eq!(cache.pending_requests("::Printer"), 0);
}

#[test]
fn test_abandoned_request_discarded() {
    let cache = test_cache(6);
    cache.add(direct("printer", "::Printer"), "app", true, None);

    let owner = MemorySession::new("owner");
    let (r0, _rx0) = request(&owner);
    cache.allocate_by_type("::Printer", r0);

    let bob = MemorySession::new("bob");
    let carol = MemorySession::new("carol");
    let (r_bob, rx_bob) = request(&bob);
    let (r_carol, mut rx_carol) = request(&carol);
    cache.allocate_by_type("::Printer", r_bob);
    cache.allocate_by_type("::Printer", r_carol);
    drop(rx_bob);

    let entry = cache.get(&id("printer")).unwrap();
    entry.release(&as_session(&owner)).unwrap();

    assert_eq!(granted(&mut rx_carol), "printer");
    assert_eq!(bob.allocation_count(), 0);
}

#[test]
fn test_type_queue_bound() {
    let mut config = RegistryConfig::with_seed(7);
    config.type_requests_count_max = 1;
    let cache = ObjectCache::with_config(config, Arc::new(MemoryLoadCache::new())).unwrap();
    cache.add(direct("printer", "::Printer"), "app", true, None);

    let bob = MemorySession::new("bob");
    let (r_bob, _rx_bob) = request(&bob);
    cache.allocate_by_type("::Printer", r_bob);

    let alice = MemorySession::new("alice");
    let (r1, mut rx1) = request(&alice);
    let (r2, mut rx2) = request(&alice);
    cache.allocate_by_type("::Printer", r1);
    cache.allocate_by_type("::Printer", r2);

    assert!(rx1.try_recv().is_err());
    let err = rx2.try_recv().unwrap().unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(
        err,
        RegistryError::RequestQueueFull {
            target: "::Printer".into(),
            limit: 1
        }
    );
}

// =============================================================================
// Least loaded
// =============================================================================

#[test]
fn test_least_loaded_prefers_lowest_score() {
    let loads = Arc::new(MemoryLoadCache::new());
    for (adapter, node, load) in [("A1", "n1", 3.0), ("A2", "n2", 1.0), ("A3", "n3", 2.0)] {
        loads.register_adapter(adapter, node);
        loads.update_node_load(node, LoadInfo::flat(load));
    }

    let mut seen = std::collections::BTreeSet::new();
    for seed in 0..64 {
        let cache = test_cache_with_loads(seed, loads.clone());
        cache.add(on_adapter("heavy", "::Worker", "A1"), "app", true, None);
        cache.add(on_adapter("light", "::Worker", "A2"), "app", true, None);
        cache.add(on_adapter("medium", "::Worker", "A3"), "app", true, None);
        cache.add(direct("local", "::Worker"), "app", true, None);

        let alice = MemorySession::new("alice");
        let (req, mut rx) = request(&alice);
        cache.allocate_by_type_on_least_loaded_node("::Worker", req, LoadSample::One);

        let name = granted(&mut rx);
        assert!(
            name == "light" || name == "local",
            "seed {} picked {}",
            seed,
            name
        );
        seen.insert(name);
    }

    // Ties broken by the shuffle, not by identity order
    assert_eq!(seen.len(), 2);
}

#[test]
fn test_least_loaded_unknown_adapter_scores_default() {
    let loads = Arc::new(MemoryLoadCache::new());
    loads.register_adapter("Busy", "n1");
    loads.update_node_load("n1", LoadInfo::flat(5.0));
    loads.register_adapter("Idle", "n2");
    loads.update_node_load("n2", LoadInfo::new(0.5, 9.0, 9.0));

    let cache = test_cache_with_loads(8, loads);
    cache.add(on_adapter("busy", "::Worker", "Busy"), "app", true, None);
    cache.add(on_adapter("gone", "::Worker", "Unregistered"), "app", true, None);
    cache.add(on_adapter("idle", "::Worker", "Idle"), "app", true, None);

    let alice = MemorySession::new("alice");
    let bob = MemorySession::new("bob");
    let carol = MemorySession::new("carol");
    let (r1, mut rx1) = request(&alice);
    let (r2, mut rx2) = request(&bob);
    let (r3, mut rx3) = request(&carol);
    cache.allocate_by_type_on_least_loaded_node("::Worker", r1, LoadSample::One);
    cache.allocate_by_type_on_least_loaded_node("::Worker", r2, LoadSample::One);
    cache.allocate_by_type_on_least_loaded_node("::Worker", r3, LoadSample::One);

    assert_eq!(granted(&mut rx1), "idle");
    assert_eq!(granted(&mut rx2), "gone");
    assert_eq!(granted(&mut rx3), "busy");
}

#[test]
fn test_least_loaded_unknown_type() {
    let cache = test_cache(9);
    let alice = MemorySession::new("alice");
    let (req, mut rx) = request(&alice);

    cache.allocate_by_type_on_least_loaded_node("::Missing", req, LoadSample::Five);
    assert_eq!(rx.try_recv().unwrap(), Ok(None));
}

// =============================================================================
// Allocation by identity
// =============================================================================

#[test]
fn test_allocate_by_identity_is_reentrant() {
    let cache = test_cache(10);
    cache.add(direct("printer", "::Printer"), "app", true, None);
    let alice = MemorySession::new("alice");

    let (r1, mut rx1) = request(&alice);
    let (r2, mut rx2) = request(&alice);
    cache.allocate(&id("printer"), r1);
    cache.allocate(&id("printer"), r2);
    assert_eq!(granted(&mut rx1), "printer");
    assert_eq!(granted(&mut rx2), "printer");

    let entry = cache.get(&id("printer")).unwrap();
    let session = as_session(&alice);
    assert!(!entry.release(&session).unwrap());
    assert!(entry.is_allocated());
    assert!(entry.release(&session).unwrap());
    assert!(!entry.is_allocated());
    assert!(matches!(
        entry.release(&session),
        Err(RegistryError::NotAllocated { .. })
    ));
}

#[test]
fn test_identity_waiters_served_before_type_waiters() {
    let cache = test_cache(11);
    cache.add(direct("printer", "::Printer"), "app", true, None);

    let owner = MemorySession::new("owner");
    let by_id = MemorySession::new("by-id");
    let by_type = MemorySession::new("by-type");
    let (r0, _rx0) = request(&owner);
    cache.allocate(&id("printer"), r0);

    let (r_type, mut rx_type) = request(&by_type);
    let (r_id, mut rx_id) = request(&by_id);
    cache.allocate_by_type("::Printer", r_type);
    cache.allocate(&id("printer"), r_id);

    let entry = cache.get(&id("printer")).unwrap();
    assert_eq!(entry.pending_requests(), 1);
    entry.release(&as_session(&owner)).unwrap();

    assert_eq!(granted(&mut rx_id), "printer");
    assert!(rx_type.try_recv().is_err());

    entry.release(&as_session(&by_id)).unwrap();
    assert_eq!(granted(&mut rx_type), "printer");
}

#[test]
fn test_allocate_non_allocatable_by_identity() {
    let cache = test_cache(12);
    cache.add(direct("locator", "::Locator"), "app", false, None);
    let alice = MemorySession::new("alice");
    let (req, mut rx) = request(&alice);

    cache.allocate(&id("locator"), req);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(RegistryError::NotAllocatable { .. })
    ));
    assert_eq!(cache.get_objects_by_type("::Locator").len(), 1);
}

#[test]
fn test_remove_cancels_identity_waiters() {
    let cache = test_cache(13);
    cache.add(direct("printer", "::Printer"), "app", true, None);
    cache.add(direct("printer-2", "::Printer"), "app", true, None);

    let owner = MemorySession::new("owner");
    let bob = MemorySession::new("bob");
    let (r0, _rx0) = request(&owner);
    let (r1, mut rx1) = request(&bob);
    cache.allocate(&id("printer"), r0);
    cache.allocate(&id("printer"), r1);

    let removed = cache.remove(&id("printer")).unwrap();
    assert_eq!(
        rx1.try_recv().unwrap(),
        Err(RegistryError::object_not_registered(&id("printer")))
    );

    // Releasing a removed entry does not touch the new registry contents
    assert!(removed.release(&as_session(&owner)).unwrap());
    assert!(cache.has_type("::Printer"));
}

// =============================================================================
// Cascade
// =============================================================================

#[test]
fn test_cascade_notifies_registry_for_each_freed_object() {
    let cache = test_cache(14);
    let group = cache.add(direct("group", "::Group"), "app", true, None);
    let parent: skerry_registry::AllocatableRef = group.clone();
    cache.add(direct("c1", "::Member"), "app", true, Some(parent.clone()));
    cache.add(direct("c2", "::Member"), "app", true, Some(parent));

    let owner = MemorySession::new("owner");
    for name in ["c1", "c2", "group"] {
        let (req, mut rx) = request(&owner);
        cache.allocate(&id(name), req);
        assert_eq!(granted(&mut rx), name);
    }
    assert_eq!(owner.allocation_count(), 3);

    let waiter = MemorySession::new("waiter");
    let (r_group, mut rx_group) = request(&waiter);
    let (r_m1, mut rx_m1) = request(&waiter);
    let (r_m2, mut rx_m2) = request(&waiter);
    cache.allocate_by_type("::Group", r_group);
    cache.allocate_by_type("::Member", r_m1);
    cache.allocate_by_type("::Member", r_m2);
    assert_eq!(cache.pending_requests("::Member"), 2);

    // One release frees the group and both members
    assert!(group.release(&as_session(&owner)).unwrap());
    assert_eq!(owner.allocation_count(), 0);

    assert_eq!(granted(&mut rx_group), "group");
    let mut members = vec![granted(&mut rx_m1), granted(&mut rx_m2)];
    members.sort();
    assert_eq!(members, vec!["c1", "c2"]);
    assert_eq!(waiter.allocation_count(), 3);
    assert_eq!(cache.pending_requests("::Group"), 0);
    assert_eq!(cache.pending_requests("::Member"), 0);
}

#[test]
fn test_child_waiters_served_when_busy_parent_frees() {
    let cache = test_cache(15);
    let group = cache.add(direct("group", "::Group"), "app", true, None);
    let parent: skerry_registry::AllocatableRef = group.clone();
    let member = cache.add(direct("c1", "::Member"), "app", true, Some(parent));

    let owner = MemorySession::new("owner");
    let (r_owner, mut rx_owner) = request(&owner);
    cache.allocate(&id("group"), r_owner);
    assert_eq!(granted(&mut rx_owner), "group");

    // c1 is free but its parent is not: both requests wait
    let bob = MemorySession::new("bob");
    let carol = MemorySession::new("carol");
    let (r_bob, mut rx_bob) = request(&bob);
    let (r_carol, mut rx_carol) = request(&carol);
    cache.allocate_by_type("::Member", r_bob);
    cache.allocate(&id("c1"), r_carol);
    assert!(!member.is_allocated());
    assert_eq!(cache.pending_requests("::Member"), 1);
    assert_eq!(member.pending_requests(), 1);

    assert!(group.release(&as_session(&owner)).unwrap());
    assert_eq!(granted(&mut rx_carol), "c1");
    assert!(rx_bob.try_recv().is_err());
    assert_eq!(group.session().unwrap().user_id(), "carol");

    assert!(member.release(&as_session(&carol)).unwrap());
    assert_eq!(granted(&mut rx_bob), "c1");
    assert_eq!(cache.pending_requests("::Member"), 0);
    assert_eq!(member.pending_requests(), 0);
}

// =============================================================================
// Sessions
// =============================================================================

#[test]
fn test_session_destroy_releases_everything() {
    let cache = test_cache(16);
    cache.add(direct("w1", "::Worker"), "app", true, None);
    cache.add(direct("w2", "::Worker"), "app", true, None);

    let alice = MemorySession::new("alice");
    for name in ["w1", "w2", "w1"] {
        let (req, mut rx) = request(&alice);
        cache.allocate(&id(name), req);
        assert_eq!(granted(&mut rx), name);
    }
    assert_eq!(alice.allocation_count(), 2);

    let bob = MemorySession::new("bob");
    let (r_bob, mut rx_bob) = request(&bob);
    cache.allocate_by_type("::Worker", r_bob);
    assert!(rx_bob.try_recv().is_err());

    // w1 needs two releases, then the waiter takes it
    assert_eq!(alice.destroy(), 2);
    assert_eq!(alice.allocation_count(), 0);
    assert_eq!(granted(&mut rx_bob), "w1");
    assert!(!cache.get(&id("w2")).unwrap().is_allocated());
    assert_eq!(bob.allocation_count(), 1);

    // A destroyed session gets no further grants
    let (late, mut rx_late) = request(&alice);
    cache.allocate(&id("w2"), late);
    assert!(matches!(
        rx_late.try_recv().unwrap(),
        Err(RegistryError::SessionDestroyed { .. })
    ));
    assert!(!cache.get(&id("w2")).unwrap().is_allocated());
}

// =============================================================================
// Async
// =============================================================================

#[tokio::test]
async fn test_queued_request_resolves_on_release() {
    let cache = test_cache(17);
    let entry = cache.add(direct("printer", "::Printer"), "app", true, None);

    let owner = MemorySession::new("owner");
    let (r0, rx0) = request(&owner);
    cache.allocate_by_type("::Printer", r0);
    assert!(rx0.await.unwrap().unwrap().is_some());

    let bob = MemorySession::new("bob");
    let (r1, rx1) = request(&bob);
    cache.allocate_by_type("::Printer", r1);

    let releaser = {
        let session = as_session(&owner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            entry.release(&session)
        })
    };

    let info = rx1.await.unwrap().unwrap().unwrap();
    assert_eq!(info.identity(), &id("printer"));
    assert!(releaser.await.unwrap().unwrap());
}
