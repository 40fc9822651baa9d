#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor::{
    primitives::pager::{PageCache, Pager, PagerOptions},
    storage::btree::{
        collect_entries, delete, spec_value, verify_tree, DeleteDriver, DeleteResult, TreeBuilder,
    },
    types::{ArborError, Geometry, Result},
};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn geometry() -> Geometry {
    Geometry::new(2, 5, 16)
}

fn cache(pager: &Arc<Pager>) -> Arc<dyn PageCache> {
    pager.clone()
}

fn loaded(opts: PagerOptions, keys: impl IntoIterator<Item = u64>) -> Result<Arc<Pager>> {
    let pager = Arc::new(Pager::in_memory(opts.page_size(512).geometry(geometry()))?);
    TreeBuilder::new()
        .fill(3)
        .bulk_load(&pager, keys.into_iter().map(|k| (k, spec_value(k))))?;
    pager.evict_clean();
    Ok(pager)
}

#[test]
fn interleaved_deletes_match_sequential_reference() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut reference: BTreeMap<u64, Vec<u8>> =
        (0u64..250).map(|k| (k * 4, spec_value(k * 4))).collect();
    let pager = loaded(PagerOptions::fully_deferred(), reference.keys().copied())?;

    let mut driver = DeleteDriver::new(cache(&pager)).with_step_budget(2);
    let mut submitted = Vec::new();
    for _ in 0..180 {
        let key = rng.gen_range(0u64..1000);
        submitted.push((driver.submit(key), key));
    }
    assert_eq!(driver.in_flight(), submitted.len());
    driver.run_until_idle()?;
    assert_eq!(driver.in_flight(), 0);

    let finished = driver.take_finished();
    assert_eq!(finished.len(), submitted.len());
    // Writers are admitted in submission order, so the reference replays
    // the same sequence.
    for (f, (waiter, key)) in finished.iter().zip(&submitted) {
        assert_eq!((f.waiter, f.key), (*waiter, *key));
        let expected = if reference.remove(key).is_some() {
            DeleteResult::Found
        } else {
            DeleteResult::NotFound
        };
        assert!(matches!(&f.outcome, Ok(result) if *result == expected), "key {key}");
    }

    let entries: BTreeMap<u64, Vec<u8>> = collect_entries(&pager)?.into_iter().collect();
    assert_eq!(entries, reference);
    let report = verify_tree(&pager)?;
    assert!(report.is_ok(), "{:?}", report.issues);

    let stats = driver.stats().snapshot();
    assert_eq!(stats.operations, submitted.len() as u64);
    assert_eq!(stats.failed, 0);
    assert!(stats.suspensions > stats.operations);
    let pager_stats = pager.stats();
    assert_eq!(pager_stats.acquisitions, pager_stats.releases);
    assert_eq!(pager_stats.leaked_buffers, 0);
    assert!(pager_stats.deferred_admissions > 0);
    Ok(())
}

#[test]
fn shuffled_drain_leaves_a_valid_empty_tree() -> Result<()> {
    let mut keys: Vec<u64> = (0u64..200).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(99));
    let pager = loaded(PagerOptions::default(), 0u64..200)?;
    let mut driver = DeleteDriver::new(cache(&pager));
    for key in &keys {
        driver.submit(*key);
    }
    driver.run_until_idle()?;
    let finished = driver.take_finished();
    assert!(finished
        .iter()
        .all(|f| matches!(f.outcome, Ok(DeleteResult::Found))));
    let report = verify_tree(&pager)?;
    assert!(report.is_ok(), "{:?}", report.issues);
    assert_eq!(report.keys, 0);
    assert_eq!(report.height, 1);
    let stats = driver.stats().snapshot();
    assert!(stats.collapses > 0);
    assert!(stats.leaf_merges > 0);
    Ok(())
}

#[test]
fn barrier_holds_admission_until_released() -> Result<()> {
    let pager = loaded(PagerOptions::default(), 0u64..30)?;
    let mut driver = DeleteDriver::new(cache(&pager));
    let barrier = pager.hold_barrier();
    let first = driver.submit(3);
    let second = driver.submit(4);
    let third = driver.submit(5);
    driver.run_until_idle()?;
    assert_eq!(driver.in_flight(), 3);
    assert!(driver.take_finished().is_empty());

    assert!(driver.cancel(second));
    assert!(!driver.cancel(second));
    drop(barrier);
    driver.run_until_idle()?;
    assert_eq!(driver.in_flight(), 0);

    let finished = driver.take_finished();
    assert_eq!(finished.len(), 3);
    assert!(matches!(finished[0].outcome, Err(ArborError::Cancelled)));
    assert_eq!(finished[0].waiter, second);
    assert_eq!(
        [finished[1].waiter, finished[2].waiter],
        [first, third]
    );
    assert!(finished[1..]
        .iter()
        .all(|f| matches!(f.outcome, Ok(DeleteResult::Found))));
    let remaining: Vec<u64> = collect_entries(&pager)?.into_iter().map(|(k, _)| k).collect();
    assert!(remaining.contains(&4));
    assert!(!remaining.contains(&3) && !remaining.contains(&5));
    assert_eq!(pager.pending_requests(), 0);
    Ok(())
}

#[test]
fn blocking_delete_reports_a_stall_behind_a_barrier() -> Result<()> {
    let pager = loaded(PagerOptions::default(), 0u64..10)?;
    let barrier = pager.hold_barrier();
    let err = delete(cache(&pager), 2).unwrap_err();
    assert!(matches!(err, ArborError::Invalid(_)));
    drop(barrier);
    assert_eq!(pager.pending_requests(), 0);
    assert_eq!(delete(cache(&pager), 2)?, DeleteResult::Found);
    Ok(())
}
