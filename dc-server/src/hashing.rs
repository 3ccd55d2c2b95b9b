//! Background hasher: one file at a time on the blocking pool, cancellable between reads.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dc_core::hash::{HashJob, JobOutcome};
use dc_core::tth::block_size_for;
use dc_core::{HashEvent, TigerTree};
use tokio_util::sync::CancellationToken;

use crate::engine::Context;
use crate::share_scan::file_stamp;

/// Tree of the file at `path`, or `None` if `cancel` fired first.
pub fn hash_file(path: &Path, cancel: &CancellationToken) -> io::Result<Option<TigerTree>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    TigerTree::hash_reader(BufReader::new(file), block_size_for(size), |_| {
        !cancel.is_cancelled()
    })
}

enum Hashed {
    Done(TigerTree),
    /// File changed while it was read; carries the new (size, mtime).
    Changed(u64, u64),
    Cancelled,
}

fn hash_job(path: &Path, stamp: (u64, u64), cancel: &CancellationToken) -> io::Result<Hashed> {
    let Some(tree) = hash_file(path, cancel)? else {
        return Ok(Hashed::Cancelled);
    };
    let now = file_stamp(path)?;
    if now != stamp {
        return Ok(Hashed::Changed(now.0, now.1));
    }
    Ok(Hashed::Done(tree))
}

pub(crate) async fn run(ctx: Arc<Context>) {
    let cancel = ctx.cancel.child_token();
    loop {
        let job = ctx.hashes.write().await.next_job();
        let Some(job) = job else {
            tokio::select! {
                _ = ctx.hash_wake.notified() => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        };
        let token = cancel.clone();
        let path = job.path.clone();
        let stamp = (job.size, job.mtime);
        tracing::debug!(path = %path.display(), size = job.size, "hashing");
        let result = tokio::task::spawn_blocking(move || hash_job(&path, stamp, &token)).await;
        match result {
            Ok(Ok(Hashed::Done(tree))) => publish(&ctx, &job, tree).await,
            Ok(Ok(Hashed::Changed(size, mtime))) => {
                tracing::debug!(path = %job.path.display(), "changed while hashing, restarting");
                restat(&ctx, &job.path, size, mtime).await;
                ctx.hashes.write().await.restart(HashJob {
                    path: job.path.clone(),
                    size,
                    mtime,
                });
            }
            Ok(Ok(Hashed::Cancelled)) => {
                ctx.hashes.write().await.restart(job);
                break;
            }
            Ok(Err(e)) => fail(&ctx, &job, e.to_string()).await,
            Err(e) => fail(&ctx, &job, e.to_string()).await,
        }
        let progress = ctx.hashes.read().await.progress();
        ctx.bus.publish(HashEvent::Progress {
            files_left: progress.files_left,
            bytes_left: progress.bytes_left,
        });
    }
    tracing::debug!("hasher stopped");
}

async fn publish(ctx: &Context, job: &HashJob, tree: TigerTree) {
    let outcome = ctx.hashes.write().await.complete(job, tree);
    let JobOutcome::Stored(record) = outcome else {
        return;
    };
    let root = record.root;
    let attached = ctx
        .share
        .write()
        .await
        .set_tth(&job.path, job.size, job.mtime, root);
    ctx.core.lock().await.attach_tree(record);
    if attached {
        ctx.share_dirty.store(true, Ordering::Release);
    }
    tracing::debug!(path = %job.path.display(), %root, "hashed");
    ctx.bus.publish(HashEvent::Hashed {
        path: job.path.clone(),
        root,
    });
}

/// Bring the share entry in line with the file on disk before hashing it again.
async fn restat(ctx: &Context, path: &Path, size: u64, mtime: u64) {
    let mut share = ctx.share.write().await;
    let virtual_path = share.entry_for_real(path).map(|e| e.virtual_path.clone());
    if let Some(vp) = virtual_path {
        share.upsert_file(vp, path.to_path_buf(), size, mtime);
    }
}

async fn fail(ctx: &Context, job: &HashJob, reason: String) {
    tracing::warn!(path = %job.path.display(), error = %reason, "hashing failed");
    ctx.hashes.write().await.fail(job);
    ctx.bus.publish(HashEvent::Failed {
        path: job.path.clone(),
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&p, &data).unwrap();
        let tree = hash_file(&p, &CancellationToken::new()).unwrap().unwrap();
        let expected = TigerTree::hash_bytes(&data, block_size_for(data.len() as u64));
        assert_eq!(tree.root, expected.root);
        assert_eq!(tree.file_size, data.len() as u64);
    }

    #[test]
    fn cancelled_hash_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.bin");
        std::fs::write(&p, vec![1u8; 1024]).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(hash_file(&p, &token).unwrap().is_none());
    }

    #[test]
    fn unchanged_file_is_done_and_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.bin");
        std::fs::write(&p, b"abc").unwrap();
        let stamp = file_stamp(&p).unwrap();
        let token = CancellationToken::new();
        assert!(matches!(hash_job(&p, stamp, &token).unwrap(), Hashed::Done(_)));
        assert!(matches!(
            hash_job(&p, (stamp.0 + 1, stamp.1), &token).unwrap(),
            Hashed::Changed(3, _)
        ));
        assert!(hash_job(&dir.path().join("gone"), stamp, &token).is_err());
    }
}
