use tracing::{info, warn};

use scanview_core::{Decision, ExperimentId, ImageId, Scan, ScanId, SessionTree, SiteId};

use crate::rest::{ClientError, RestClient};

/// Load the whole hierarchy for the server's first session.
///
/// Walks sessions → experiments → scans → images and hands the records to
/// the tree builder, which resolves all navigation links. An empty server
/// yields an empty tree.
pub fn load_session_tree(client: &RestClient) -> Result<SessionTree, ClientError> {
    let sessions = client.sessions()?;
    let Some(session) = sessions.first() else {
        warn!("server has no sessions");
        return Ok(SessionTree::builder().build());
    };
    info!(session = %session.id, "loading session hierarchy");

    let mut builder = SessionTree::builder();
    for experiment in client.experiments(&session.id)? {
        let experiment_id = ExperimentId::from(experiment.id.as_str());
        builder.add_experiment(experiment_id.clone(), experiment.name)?;

        for scan in client.scans(&experiment.id)? {
            let scan_id = ScanId::from(scan.id.as_str());
            builder.add_scan(Scan {
                id: scan_id.clone(),
                name: scan.scan_type,
                experiment: experiment_id.clone(),
                image_count: 0,
                site: scan.site.map(SiteId::from),
                notes: scan.notes.into_iter().map(|n| n.note).collect(),
                decisions: scan
                    .decisions
                    .into_iter()
                    .map(|d| Decision {
                        decision: d.decision,
                        creator: d.creator,
                    })
                    .collect(),
            })?;

            for image in client.images(&scan.id)? {
                builder.add_image(&scan_id, ImageId::from(image.id))?;
            }
        }
    }

    let tree = builder.build();
    info!(
        experiments = tree.experiment_count(),
        scans = tree.scan_count(),
        images = tree.image_count(),
        "session hierarchy loaded"
    );
    Ok(tree)
}
