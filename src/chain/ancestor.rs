//! Common-ancestor resolution between two chain forks.

use dashcore::BlockHash;

use crate::chain::ChainBackend;
use crate::error::{DispatchError, NotifyError, Result};

/// Find the height of the nearest common ancestor of two blocks known to sit
/// at the same height on different forks.
///
/// Walks both forks backwards via `prev_blockhash` until the hashes meet.
/// The walk is bounded by `max_depth` steps; exceeding it returns
/// [`DispatchError::ReorgTooDeep`], which is unrecoverable for the caller's
/// view of the chain.
pub(crate) async fn common_ancestor_height<B: ChainBackend + ?Sized>(
    backend: &B,
    mut reorg_hash: BlockHash,
    mut chain_hash: BlockHash,
    max_depth: u32,
) -> Result<i32> {
    let mut steps = 0u32;

    while reorg_hash != chain_hash {
        if steps >= max_depth {
            return Err(NotifyError::Dispatch(DispatchError::ReorgTooDeep {
                depth: max_depth,
            }));
        }

        let reorg_header = backend.block_header(&reorg_hash).await?;
        let chain_header = backend.block_header(&chain_hash).await?;
        reorg_hash = reorg_header.prev_blockhash;
        chain_hash = chain_header.prev_blockhash;
        steps += 1;
    }

    let height = backend.block_header_height(&chain_hash).await?;
    Ok(height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::test_utils::MockChainBackend;

    #[tokio::test]
    async fn test_common_ancestor_of_identical_hashes() {
        let backend = MockChainBackend::with_chain_height(10);
        let tip = backend.tip();

        let height = common_ancestor_height(&backend, tip.hash, tip.hash, 100)
            .await
            .expect("ancestor lookup must succeed");
        assert_eq!(height, 10);
    }

    #[tokio::test]
    async fn test_common_ancestor_across_fork() {
        let backend = MockChainBackend::with_chain_height(10);

        // Fork away from height 7, ending at the same height as the old tip.
        let old_tip = backend.tip();
        let fork_tips = backend.build_fork(7, 3);
        let new_tip = *fork_tips.last().unwrap();

        let height = common_ancestor_height(&backend, old_tip.hash, new_tip.hash, 100)
            .await
            .expect("ancestor lookup must succeed");
        assert_eq!(height, 7);
    }

    #[tokio::test]
    async fn test_walk_bounded_by_safety_depth() {
        let backend = MockChainBackend::with_chain_height(10);

        let old_tip = backend.tip();
        let fork_tips = backend.build_fork(4, 6);
        let new_tip = *fork_tips.last().unwrap();

        // The fork is 6 blocks deep; a bound of 3 must trip.
        let err = common_ancestor_height(&backend, old_tip.hash, new_tip.hash, 3)
            .await
            .expect_err("walk must exhaust the bound");
        assert!(matches!(
            err,
            NotifyError::Dispatch(DispatchError::ReorgTooDeep { depth: 3 })
        ));
    }
}
