#![allow(missing_docs)]

use std::sync::Arc;

use arbor::{
    primitives::pager::{AccessMode, PageCache, Pager, PagerOptions, TxnMode},
    storage::btree::{
        collect_entries, delete, spec_value, verify_tree, DeleteDriver, DeleteResult,
        InternalNode, Node, TreeBuilder, TreeSpec,
    },
    types::{Geometry, PageId, Result},
};

fn open_pager() -> Result<Arc<Pager>> {
    let opts = PagerOptions::default()
        .page_size(512)
        .geometry(Geometry::new(2, 5, 16));
    Ok(Arc::new(Pager::in_memory(opts)?))
}

fn cache(pager: &Arc<Pager>) -> Arc<dyn PageCache> {
    pager.clone()
}

fn read_node(pager: &Pager, page: PageId) -> Result<Node> {
    let mut txn = pager.begin_blocking(TxnMode::Read)?;
    let buffer = txn.acquire_blocking(page, AccessMode::Read)?;
    let node = Node::decode(page, &buffer.data());
    buffer.release();
    txn.commit_blocking()?;
    node
}

fn internal(pager: &Pager, page: PageId) -> Result<InternalNode> {
    match read_node(pager, page)? {
        Node::Internal(node) => Ok(node),
        Node::Leaf(_) => panic!("page {} is a leaf", page.0),
    }
}

fn leaf_keys(pager: &Pager, page: PageId) -> Result<Vec<u64>> {
    match read_node(pager, page)? {
        Node::Leaf(leaf) => Ok(leaf.entries.into_iter().map(|(k, _)| k).collect()),
        Node::Internal(_) => panic!("page {} is internal", page.0),
    }
}

fn keys(pager: &Pager) -> Result<Vec<u64>> {
    Ok(collect_entries(pager)?.into_iter().map(|(k, _)| k).collect())
}

fn assert_valid(pager: &Pager) -> Result<()> {
    let report = verify_tree(pager)?;
    assert!(report.is_ok(), "tree invalid: {:?}", report.issues);
    Ok(())
}

#[test]
fn empty_tree_delete_is_not_found() -> Result<()> {
    let pager = open_pager()?;
    let before = pager.stats();
    assert_eq!(delete(cache(&pager), 5)?, DeleteResult::NotFound);
    let after = pager.stats();
    // Only the superblock is acquired.
    assert_eq!(after.acquisitions - before.acquisitions, 1);
    assert_eq!(pager.superblock()?.root, PageId::NULL);
    Ok(())
}

#[test]
fn single_leaf_root_is_exempt_from_underflow() -> Result<()> {
    let pager = open_pager()?;
    let root = TreeBuilder::new().write_spec(&pager, &TreeSpec::leaf([1, 2, 3]))?;
    let mut driver = DeleteDriver::new(cache(&pager));
    driver.submit(2);
    driver.run_until_idle()?;
    let finished = driver.take_finished();
    assert!(matches!(finished[0].outcome, Ok(DeleteResult::Found)));
    assert_eq!(leaf_keys(&pager, root)?, vec![1, 3]);
    let stats = driver.stats().snapshot();
    assert_eq!(stats.collapses + stats.leaf_merges + stats.leaf_levels, 0);
    assert_eq!(pager.superblock()?.root, root);
    Ok(())
}

#[test]
fn underfull_leaf_with_underfull_sibling_merges() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([
        TreeSpec::internal([
            TreeSpec::leaf([10, 11]),
            TreeSpec::leaf([20, 21]),
            TreeSpec::leaf([30, 31, 32]),
            TreeSpec::leaf([40, 41, 42]),
        ]),
        TreeSpec::internal([
            TreeSpec::leaf([50, 51, 52]),
            TreeSpec::leaf([60, 61, 62]),
            TreeSpec::leaf([70, 71, 72]),
        ]),
    ]);
    let root = TreeBuilder::new().write_spec(&pager, &spec)?;
    assert_valid(&pager)?;
    let parent_page = internal(&pager, root)?.children[0];
    let parent = internal(&pager, parent_page)?;
    let (target, sibling) = (parent.children[0], parent.children[1]);

    assert_eq!(delete(cache(&pager), 11)?, DeleteResult::Found);

    let parent = internal(&pager, parent_page)?;
    assert_eq!(parent.children.len(), 3);
    assert_eq!(parent.keys, vec![30, 40]);
    assert_eq!(parent.children[0], target);
    assert!(!parent.children.contains(&sibling));
    assert_eq!(leaf_keys(&pager, target)?, vec![10, 20, 21]);
    assert!(pager.free_pages()?.contains(&sibling));
    assert_valid(&pager)?;
    assert_eq!(verify_tree(&pager)?.height, 3);
    Ok(())
}

#[test]
fn merge_with_left_sibling_keeps_target_page() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([
        TreeSpec::leaf([10, 11, 12]),
        TreeSpec::leaf([20, 21]),
        TreeSpec::leaf([30, 31]),
    ]);
    let root = TreeBuilder::new().write_spec(&pager, &spec)?;
    let before = internal(&pager, root)?;
    let (left, target) = (before.children[1], before.children[2]);

    assert_eq!(delete(cache(&pager), 31)?, DeleteResult::Found);

    let after = internal(&pager, root)?;
    assert_eq!(after.keys, vec![20]);
    assert_eq!(after.children, vec![before.children[0], target]);
    assert_eq!(leaf_keys(&pager, target)?, vec![20, 21, 30]);
    assert!(pager.free_pages()?.contains(&left));
    assert_valid(&pager)?;
    Ok(())
}

#[test]
fn singleton_root_collapses_and_tree_shrinks() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([TreeSpec::leaf([10, 11]), TreeSpec::leaf([20, 21])]);
    let root = TreeBuilder::new().write_spec(&pager, &spec)?;
    let children = internal(&pager, root)?.children;
    assert_eq!(verify_tree(&pager)?.height, 2);

    let mut driver = DeleteDriver::new(cache(&pager));
    driver.submit(10);
    driver.run_until_idle()?;
    assert!(matches!(
        driver.take_finished()[0].outcome,
        Ok(DeleteResult::Found)
    ));
    assert_eq!(driver.stats().snapshot().collapses, 1);

    // The root page now holds the merged leaf directly.
    assert_eq!(pager.superblock()?.root, root);
    assert_eq!(leaf_keys(&pager, root)?, vec![11, 20, 21]);
    let free = pager.free_pages()?;
    assert!(children.iter().all(|child| free.contains(child)));
    let report = verify_tree(&pager)?;
    assert!(report.is_ok(), "{:?}", report.issues);
    assert_eq!(report.height, 1);
    Ok(())
}

#[test]
fn singleton_root_over_internal_children_collapses() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([
        TreeSpec::internal([
            TreeSpec::leaf([1, 2, 3]),
            TreeSpec::leaf([4, 5, 6]),
            TreeSpec::leaf([7, 8, 9]),
        ]),
        TreeSpec::internal([
            TreeSpec::leaf([10, 11, 12]),
            TreeSpec::leaf([13, 14, 15]),
            TreeSpec::leaf([16, 17, 18]),
        ]),
    ]);
    let root = TreeBuilder::new().write_spec(&pager, &spec)?;
    assert_eq!(verify_tree(&pager)?.height, 3);

    assert_eq!(delete(cache(&pager), 14)?, DeleteResult::Found);

    let root_node = internal(&pager, root)?;
    assert_eq!(root_node.keys, vec![4, 7, 10, 13, 16]);
    assert_eq!(root_node.children.len(), 6);
    let report = verify_tree(&pager)?;
    assert!(report.is_ok(), "{:?}", report.issues);
    assert_eq!(report.height, 2);
    assert_eq!(report.free_pages, 2);
    Ok(())
}

#[test]
fn underfull_leaf_borrows_from_right_sibling() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([TreeSpec::leaf([10, 11]), TreeSpec::leaf([20, 21, 22, 23])]);
    let root = TreeBuilder::new().write_spec(&pager, &spec)?;
    let children = internal(&pager, root)?.children;

    assert_eq!(delete(cache(&pager), 10)?, DeleteResult::Found);

    let root_node = internal(&pager, root)?;
    assert_eq!(root_node.children, children);
    assert_eq!(root_node.keys, vec![21]);
    assert_eq!(leaf_keys(&pager, children[0])?, vec![11, 20]);
    assert_eq!(leaf_keys(&pager, children[1])?, vec![21, 22, 23]);
    assert!(pager.free_pages()?.is_empty());
    assert_valid(&pager)?;
    Ok(())
}

#[test]
fn underfull_leaf_borrows_from_left_sibling() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([TreeSpec::leaf([10, 11, 12, 13]), TreeSpec::leaf([40, 41])]);
    let root = TreeBuilder::new().write_spec(&pager, &spec)?;
    let children = internal(&pager, root)?.children;

    assert_eq!(delete(cache(&pager), 40)?, DeleteResult::Found);

    assert_eq!(internal(&pager, root)?.keys, vec![13]);
    assert_eq!(leaf_keys(&pager, children[0])?, vec![10, 11, 12]);
    assert_eq!(leaf_keys(&pager, children[1])?, vec![13, 41]);
    assert_valid(&pager)?;
    Ok(())
}

#[test]
fn missing_key_still_rebalances_on_the_way_down() -> Result<()> {
    let pager = open_pager()?;
    let spec = TreeSpec::internal([TreeSpec::leaf([10, 11]), TreeSpec::leaf([20, 21, 22, 23])]);
    TreeBuilder::new().write_spec(&pager, &spec)?;

    assert_eq!(delete(cache(&pager), 12)?, DeleteResult::NotFound);

    assert_eq!(keys(&pager)?, vec![10, 11, 20, 21, 22, 23]);
    assert_valid(&pager)?;
    let entries = collect_entries(&pager)?;
    assert!(entries.iter().all(|(k, v)| *v == spec_value(*k)));
    Ok(())
}

#[test]
fn same_deletes_produce_same_layout() -> Result<()> {
    let load = |pager: &Pager| {
        TreeBuilder::new()
            .fill(3)
            .bulk_load(pager, (0u64..90).map(|k| (k * 2, spec_value(k))))
    };
    let order: Vec<u64> = (0u64..90).map(|i| (i * 37) % 180).collect();
    let mut reports = Vec::new();
    for _ in 0..2 {
        let pager = open_pager()?;
        load(&pager)?;
        for key in &order {
            delete(cache(&pager), *key)?;
        }
        reports.push((verify_tree(&pager)?, collect_entries(&pager)?, pager.free_pages()?));
    }
    assert_eq!(reports[0], reports[1]);
    assert!(reports[0].0.is_ok());
    Ok(())
}
