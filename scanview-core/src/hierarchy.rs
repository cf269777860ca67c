use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;
use crate::id::{ExperimentId, ImageId, ScanId, SiteId};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A reviewer's verdict on a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub creator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    /// Position within the session's experiment ordering.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub name: String,
    pub experiment: ExperimentId,
    /// Number of images, filled in when the tree is built.
    pub image_count: usize,
    pub site: Option<SiteId>,
    pub notes: Vec<String>,
    pub decisions: Vec<Decision>,
}

/// A single image together with its precomputed navigation links.
///
/// The links make stepping through a session O(1): within a scan via
/// `previous_image`/`next_image`, and across scan boundaries via the
/// first image of the neighbouring scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub scan: ScanId,
    pub experiment: ExperimentId,
    /// Position within the owning scan.
    pub index: usize,
    pub previous_image: Option<ImageId>,
    pub next_image: Option<ImageId>,
    pub first_image_in_previous_scan: Option<ImageId>,
    pub first_image_in_next_scan: Option<ImageId>,
}

// ---------------------------------------------------------------------------
// SessionTree
// ---------------------------------------------------------------------------

/// The immutable experiment → scan → image hierarchy of one session.
///
/// Built once after loading; all navigation links are resolved at build
/// time so lookups never walk the hierarchy.
#[derive(Debug, Clone, Default)]
pub struct SessionTree {
    experiment_order: Vec<ExperimentId>,
    experiments: HashMap<ExperimentId, Experiment>,
    experiment_scans: HashMap<ExperimentId, Vec<ScanId>>,
    scans: HashMap<ScanId, Scan>,
    scan_images: HashMap<ScanId, Vec<ImageId>>,
    images: HashMap<ImageId, Image>,
}

impl SessionTree {
    pub fn builder() -> SessionTreeBuilder {
        SessionTreeBuilder::default()
    }

    /// Experiments in session order.
    pub fn experiments(&self) -> impl Iterator<Item = &Experiment> {
        self.experiment_order
            .iter()
            .filter_map(|id| self.experiments.get(id))
    }

    pub fn experiment(&self, id: &ExperimentId) -> Option<&Experiment> {
        self.experiments.get(id)
    }

    pub fn scan(&self, id: &ScanId) -> Option<&Scan> {
        self.scans.get(id)
    }

    pub fn image(&self, id: &ImageId) -> Option<&Image> {
        self.images.get(id)
    }

    /// Scan ids of an experiment, in display order.
    pub fn scans_of(&self, experiment: &ExperimentId) -> &[ScanId] {
        self.experiment_scans
            .get(experiment)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Image ids of a scan, in acquisition order.
    pub fn images_of(&self, scan: &ScanId) -> &[ImageId] {
        self.scan_images
            .get(scan)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every image id of an experiment, flattened in scan order.
    pub fn experiment_images(&self, experiment: &ExperimentId) -> Vec<ImageId> {
        self.scans_of(experiment)
            .iter()
            .flat_map(|scan| self.images_of(scan).iter().cloned())
            .collect()
    }

    /// First image of the experiment preceding the one owning `image`.
    pub fn first_image_in_previous_experiment(&self, image: &ImageId) -> Option<ImageId> {
        let experiment = &self.images.get(image)?.experiment;
        let index = self.experiments.get(experiment)?.index;
        let previous = self.experiment_order.get(index.checked_sub(1)?)?;
        self.first_image_of_experiment(previous)
    }

    /// First image of the experiment following the one owning `image`.
    pub fn first_image_in_next_experiment(&self, image: &ImageId) -> Option<ImageId> {
        let experiment = &self.images.get(image)?.experiment;
        let index = self.experiments.get(experiment)?.index;
        let next = self.experiment_order.get(index + 1)?;
        self.first_image_of_experiment(next)
    }

    fn first_image_of_experiment(&self, experiment: &ExperimentId) -> Option<ImageId> {
        self.scans_of(experiment)
            .iter()
            .find_map(|scan| self.images_of(scan).first().cloned())
    }

    pub fn experiment_count(&self) -> usize {
        self.experiment_order.len()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Accumulates the hierarchy, then resolves navigation links in `build`.
#[derive(Debug, Default)]
pub struct SessionTreeBuilder {
    experiment_order: Vec<ExperimentId>,
    experiments: HashMap<ExperimentId, Experiment>,
    experiment_scans: HashMap<ExperimentId, Vec<ScanId>>,
    scans: HashMap<ScanId, Scan>,
    scan_images: HashMap<ScanId, Vec<ImageId>>,
    seen_images: HashMap<ImageId, ScanId>,
}

impl SessionTreeBuilder {
    pub fn add_experiment(
        &mut self,
        id: ExperimentId,
        name: impl Into<String>,
    ) -> crate::Result<()> {
        if self.experiments.contains_key(&id) {
            return Err(CoreError::DuplicateExperiment(id.to_string()));
        }
        let index = self.experiment_order.len();
        self.experiment_order.push(id.clone());
        self.experiment_scans.insert(id.clone(), Vec::new());
        self.experiments.insert(
            id.clone(),
            Experiment {
                id,
                name: name.into(),
                index,
            },
        );
        Ok(())
    }

    /// Add a scan to a previously added experiment. `scan.image_count` is
    /// ignored; it is recomputed in [`build`](Self::build).
    pub fn add_scan(&mut self, scan: Scan) -> crate::Result<()> {
        if !self.experiments.contains_key(&scan.experiment) {
            return Err(CoreError::UnknownExperiment(scan.experiment.to_string()));
        }
        if self.scans.contains_key(&scan.id) {
            return Err(CoreError::DuplicateScan(scan.id.to_string()));
        }
        if let Some(scans) = self.experiment_scans.get_mut(&scan.experiment) {
            scans.push(scan.id.clone());
        }
        self.scan_images.insert(scan.id.clone(), Vec::new());
        self.scans.insert(scan.id.clone(), scan);
        Ok(())
    }

    pub fn add_image(&mut self, scan: &ScanId, image: ImageId) -> crate::Result<()> {
        let Some(images) = self.scan_images.get_mut(scan) else {
            return Err(CoreError::UnknownScan(scan.to_string()));
        };
        if self.seen_images.contains_key(&image) {
            return Err(CoreError::DuplicateImage(image.to_string()));
        }
        self.seen_images.insert(image.clone(), scan.clone());
        images.push(image);
        Ok(())
    }

    /// Resolve navigation links and freeze the tree.
    ///
    /// A forward pass fills `previous_image`/`next_image` and
    /// `first_image_in_previous_scan`; a backward pass fills
    /// `first_image_in_next_scan`. Scan boundaries are ignored for the
    /// "previous/next scan" links only when a scan has no images at all.
    pub fn build(mut self) -> SessionTree {
        let mut images: HashMap<ImageId, Image> = HashMap::with_capacity(self.seen_images.len());

        let mut first_in_previous: Option<ImageId> = None;
        for experiment in &self.experiment_order {
            for scan in self.experiment_scans.get(experiment).into_iter().flatten() {
                let ids = self.scan_images.get(scan).map(Vec::as_slice).unwrap_or(&[]);
                if ids.is_empty() {
                    warn!(scan = %scan, "scan has no images");
                }
                for (index, id) in ids.iter().enumerate() {
                    images.insert(
                        id.clone(),
                        Image {
                            id: id.clone(),
                            scan: scan.clone(),
                            experiment: experiment.clone(),
                            index,
                            previous_image: index.checked_sub(1).map(|i| ids[i].clone()),
                            next_image: ids.get(index + 1).cloned(),
                            first_image_in_previous_scan: first_in_previous.clone(),
                            first_image_in_next_scan: None,
                        },
                    );
                }
                if let Some(first) = ids.first() {
                    first_in_previous = Some(first.clone());
                }
            }
        }

        let mut first_in_next: Option<ImageId> = None;
        for experiment in self.experiment_order.iter().rev() {
            for scan in self
                .experiment_scans
                .get(experiment)
                .into_iter()
                .flatten()
                .rev()
            {
                let ids = self.scan_images.get(scan).map(Vec::as_slice).unwrap_or(&[]);
                for id in ids {
                    if let Some(image) = images.get_mut(id) {
                        image.first_image_in_next_scan = first_in_next.clone();
                    }
                }
                if let Some(first) = ids.first() {
                    first_in_next = Some(first.clone());
                }
            }
        }

        for (scan, ids) in &self.scan_images {
            if let Some(record) = self.scans.get_mut(scan) {
                record.image_count = ids.len();
            }
        }

        SessionTree {
            experiment_order: self.experiment_order,
            experiments: self.experiments,
            experiment_scans: self.experiment_scans,
            scans: self.scans,
            scan_images: self.scan_images,
            images,
        }
    }
}
