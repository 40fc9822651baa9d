#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use arbor::{
    primitives::pager::{
        CommitMode, CompletionEvent, PageCache, Pager, PagerOptions, PagerStats, TxnMode,
    },
    storage::btree::{
        collect_entries, spec_value, verify_tree, DeleteOperation, DeleteResult, DeleteStep,
        Progress, TreeBuilder, VerifyReport,
    },
    types::{ArborError, Geometry, Result, TxnId},
};
use proptest::prelude::*;

fn geometry() -> Geometry {
    Geometry::new(2, 5, 16)
}

fn immediate() -> PagerOptions {
    PagerOptions::default().page_size(512).geometry(geometry())
}

fn deferred() -> PagerOptions {
    PagerOptions::fully_deferred()
        .page_size(512)
        .geometry(geometry())
}

fn cache(pager: &Arc<Pager>) -> Arc<dyn PageCache> {
    pager.clone()
}

struct Run {
    result: DeleteResult,
    suspensions: usize,
}

fn run(pager: &Arc<Pager>, key: u64) -> Result<Run> {
    let mut op = DeleteOperation::new(cache(pager), key);
    let mut suspensions = 0;
    let mut progress = op.resume(None)?;
    while progress != Progress::Done {
        match progress {
            Progress::Suspended => {
                suspensions += 1;
                assert!(op.is_suspended());
                let completion = pager
                    .poll_completion()?
                    .expect("a suspended delete has exactly one queued completion");
                assert_eq!(completion.waiter, op.waiter());
                progress = op.resume(Some(completion.event))?;
            }
            _ => progress = op.resume(None)?,
        }
    }
    let result = op.result().expect("finished delete has a result");
    Ok(Run {
        result,
        suspensions,
    })
}

fn assert_quiescent(pager: &Pager, before: PagerStats) {
    let after = pager.stats();
    assert_eq!(pager.pinned_frames(), 0);
    assert_eq!(pager.pending_requests(), 0);
    assert_eq!(after.leaked_buffers, 0);
    assert_eq!(
        after.acquisitions - before.acquisitions,
        after.releases - before.releases
    );
    assert_eq!(after.commits - before.commits, 1);
    assert_eq!(after.aborts, before.aborts);
}

type Outcome = (Vec<DeleteResult>, VerifyReport, Vec<(u64, Vec<u8>)>);

fn replay(opts: PagerOptions, initial: &BTreeSet<u64>, deletes: &[u64]) -> Result<Outcome> {
    let pager = Arc::new(Pager::in_memory(opts)?);
    TreeBuilder::new()
        .fill(3)
        .bulk_load(&pager, initial.iter().map(|k| (*k, spec_value(*k))))?;
    pager.evict_clean();
    let mut results = Vec::new();
    for key in deletes {
        let before = pager.stats();
        let run = run(&pager, *key)?;
        assert_quiescent(&pager, before);
        if pager.options().commit_mode == CommitMode::Deferred {
            assert!(run.suspensions >= 1);
        } else {
            assert_eq!(run.suspensions, 0);
        }
        results.push(run.result);
    }
    Ok((results, verify_tree(&pager)?, collect_entries(&pager)?))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn deferred_and_immediate_deletes_agree(
        initial in prop::collection::btree_set(0u64..400, 1..150),
        deletes in prop::collection::vec(0u64..400, 1..60),
    ) {
        let inline = replay(immediate(), &initial, &deletes).unwrap();
        let suspended = replay(deferred(), &initial, &deletes).unwrap();
        prop_assert!(inline.1.is_ok(), "{:?}", inline.1.issues);
        prop_assert_eq!(&inline, &suspended);

        let mut expected = initial.clone();
        for (key, result) in deletes.iter().zip(&inline.0) {
            let found = expected.remove(key);
            prop_assert_eq!(*result == DeleteResult::Found, found);
        }
        let remaining: Vec<u64> = inline.2.iter().map(|(k, _)| *k).collect();
        prop_assert_eq!(remaining, expected.into_iter().collect::<Vec<_>>());
    }
}

#[test]
fn mismatched_event_kind_is_rejected() -> Result<()> {
    let pager = Arc::new(Pager::in_memory(deferred())?);
    TreeBuilder::new().bulk_load(&pager, (0u64..20).map(|k| (k, spec_value(k))))?;
    pager.evict_clean();
    let mut op = DeleteOperation::new(cache(&pager), 3);
    assert_eq!(op.resume(None)?, Progress::Suspended);
    assert_eq!(op.step(), DeleteStep::AcquireSuperblock);

    let stray = pager.begin_blocking(TxnMode::Read)?;
    let err = op
        .resume(Some(CompletionEvent::TransactionReady(stray)))
        .unwrap_err();
    assert!(matches!(err, ArborError::Protocol(_)));
    assert!(op.is_finished());
    assert!(matches!(op.resume(None), Err(ArborError::Protocol(_))));
    assert_eq!(pager.pending_requests(), 0);
    assert_eq!(pager.pinned_frames(), 0);
    assert_eq!(verify_tree(&pager)?.keys, 20);
    Ok(())
}

#[test]
fn failed_completion_tears_the_operation_down() -> Result<()> {
    let pager = Arc::new(Pager::in_memory(deferred())?);
    TreeBuilder::new().bulk_load(&pager, (0u64..20).map(|k| (k, spec_value(k))))?;
    pager.evict_clean();
    let mut op = DeleteOperation::new(cache(&pager), 3);
    assert_eq!(op.resume(None)?, Progress::Suspended);
    let err = op
        .resume(Some(CompletionEvent::Failed(ArborError::Corruption("bad sector"))))
        .unwrap_err();
    assert!(matches!(err, ArborError::Corruption("bad sector")));
    assert_eq!(op.result(), None);
    assert_eq!(pager.pending_requests(), 0);
    assert_eq!(pager.pinned_frames(), 0);
    assert_eq!(pager.stats().aborts, 1);
    Ok(())
}

#[test]
fn commit_confirmation_for_another_transaction_is_rejected() -> Result<()> {
    let opts = immediate().commit_mode(CommitMode::Deferred);
    let pager = Arc::new(Pager::in_memory(opts)?);
    TreeBuilder::new().bulk_load(&pager, (0u64..20).map(|k| (k, spec_value(k))))?;
    let mut op = DeleteOperation::new(cache(&pager), 3);
    assert_eq!(op.resume(None)?, Progress::Suspended);
    assert_eq!(op.step(), DeleteStep::Committing);
    assert_eq!(pager.pinned_frames(), 0);

    let err = op
        .resume(Some(CompletionEvent::CommitConfirmed(TxnId(u64::MAX))))
        .unwrap_err();
    assert!(matches!(err, ArborError::Protocol(_)));

    // The queued commit was already handed over and still lands.
    let completion = pager.poll_completion()?.expect("queued commit");
    assert_eq!(completion.waiter, op.waiter());
    assert!(matches!(completion.event, CompletionEvent::CommitConfirmed(_)));
    assert_eq!(verify_tree(&pager)?.keys, 19);
    Ok(())
}

#[test]
fn cancel_while_awaiting_each_request_leaves_tree_intact() -> Result<()> {
    let initial: Vec<u64> = (0u64..60).collect();
    for stop_after in 0..8 {
        let pager = Arc::new(Pager::in_memory(deferred())?);
        TreeBuilder::new()
            .fill(2)
            .bulk_load(&pager, initial.iter().map(|k| (*k, spec_value(*k))))?;
        pager.evict_clean();
        let before = pager.stats();
        let mut op = DeleteOperation::new(cache(&pager), 1);
        let mut progress = op.resume(None)?;
        let mut delivered = 0;
        while progress == Progress::Suspended && delivered < stop_after {
            let completion = pager.poll_completion()?.expect("queued completion");
            progress = op.resume(Some(completion.event))?;
            delivered += 1;
        }
        let committing = op.step() == DeleteStep::Committing;
        op.cancel();
        if committing {
            // A commit already queued is not recalled.
            while pager.poll_completion()?.is_some() {}
        }
        let after = pager.stats();
        assert_eq!(pager.pinned_frames(), 0);
        assert_eq!(pager.pending_requests(), 0);
        assert_eq!(after.leaked_buffers, 0);
        assert_eq!(
            after.acquisitions - before.acquisitions,
            after.releases - before.releases
        );
        let report = verify_tree(&pager)?;
        assert!(report.is_ok(), "{:?}", report.issues);
        let expected = if committing || progress == Progress::Done { 59 } else { 60 };
        assert_eq!(report.keys, expected, "stopped after {stop_after}");
    }
    Ok(())
}
