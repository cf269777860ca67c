use std::thread;

use tracing::{debug, info, warn};

use scanview_core::ExperimentId;

use crate::pool::DecodeTask;
use crate::session::SessionContext;

/// React to the focused experiment changing.
///
/// Ordered so a late prefetch can never land in a freshly evicted slot:
/// the old batch is cancelled, then the departed experiment's entries are
/// dropped from both caches, and only then is the new batch submitted. The
/// cancelled batch's cache inserts are generation-guarded, so anything it
/// settles afterwards is discarded at the cache.
pub(crate) fn experiment_changed(
    ctx: &SessionContext,
    old: Option<&ExperimentId>,
    new: Option<&ExperimentId>,
) {
    let Some(new) = new else { return };
    if old == Some(new) {
        return;
    }
    if ctx.tree().experiment(new).is_none() {
        warn!(experiment = %new, "ignoring change to unknown experiment");
        return;
    }

    ctx.set_focused_experiment(new.clone());
    if let Some(previous) = ctx.pool().current_run_id() {
        ctx.pool().cancel(previous);
    }

    if let Some(old) = old {
        let departed = ctx.tree().experiment_images(old);
        ctx.env().raw.evict(departed.iter());
        ctx.env().volumes.evict(departed.iter());
        debug!(experiment = %old, images = departed.len(), "evicted departed experiment");
    }

    let mut tasks = Vec::new();
    for scan in ctx.tree().scans_of(new) {
        for image in ctx.tree().images_of(scan) {
            tasks.push(DecodeTask {
                image: image.clone(),
                scan: scan.clone(),
            });
        }
    }
    let total = tasks.len();

    ctx.state().set_loading_experiment(true);
    ctx.state().set_cached_progress(0, total);
    info!(experiment = %new, images = total, "prefetching experiment");

    let progress_state = ctx.state().clone();
    let run = ctx.pool().submit_batch(ctx.env().clone(), tasks, move |done, total| {
        progress_state.set_cached_progress(done, total);
    });

    let run_id = run.run_id;
    let latest = ctx.latest_prefetch().clone();
    latest.store(run_id, std::sync::atomic::Ordering::SeqCst);
    let monitor_state = ctx.state().clone();
    thread::Builder::new()
        .name("prefetch-monitor".into())
        .spawn(move || {
            match run.wait() {
                Ok(outcomes) => {
                    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
                    info!(run_id, settled = outcomes.len(), failed, "prefetch batch settled");
                }
                Err(err) => warn!(run_id, error = %err, "prefetch batch aborted"),
            }
            // A superseded batch settling late must not clear the flag
            // for the batch that replaced it.
            if latest.load(std::sync::atomic::Ordering::SeqCst) == run_id {
                monitor_state.set_loading_experiment(false);
            }
        })
        .expect("failed to spawn prefetch monitor thread");
}
