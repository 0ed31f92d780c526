//! The `Codec` contract and the directory layout a batch run walks (§4.K).

use std::path::PathBuf;

use pie4k_resources::ResourceReader;
use pie4k_scheduler::OperationsMonitor;
use pie4k_shared::error::Result;
use pie4k_upscale::UpscalerService;

/// `<work_root>/{extract,upscaled,output}/<type_code_hex>/` per resource
/// type, matching the "whole-directory batches" shape §4.I's batch
/// processing expects as input.
pub struct WorkDirs {
    root: PathBuf,
}

impl WorkDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkDirs { root: root.into() }
    }

    pub fn extract_dir(&self, type_code: u16) -> PathBuf {
        self.root.join("extract").join(format!("{type_code:04x}"))
    }

    pub fn upscaled_dir(&self, type_code: u16) -> PathBuf {
        self.root.join("upscaled").join(format!("{type_code:04x}"))
    }

    pub fn output_dir(&self, type_code: u16) -> PathBuf {
        self.root.join("output").join(format!("{type_code:04x}"))
    }
}

/// A per-resource-type collaborator driving resources through the
/// extract/upscale/assemble pipeline (§4.K). `extract` and `assemble` are
/// per-resource; `upscale` operates on the whole extracted directory at
/// once so it can be handed straight to [`UpscalerService::process_directory`].
pub trait Codec {
    /// The resource type code this codec handles.
    fn resource_type(&self) -> u16;

    /// Pull one resource's bytes out of the archive and write it to
    /// `dirs.extract_dir(type)` in whatever intermediate form `upscale`
    /// expects. Returns the path written.
    fn extract(&self, reader: &ResourceReader, name: &str, dirs: &WorkDirs) -> Result<PathBuf>;

    /// Run every intermediate under `dirs.extract_dir(type)` through
    /// whatever upscaling it needs, writing into `dirs.upscaled_dir(type)`.
    fn upscale(&self, dirs: &WorkDirs, operations: &OperationsMonitor, upscaler: &UpscalerService, scale: u32) -> Result<()>;

    /// Reassemble the upscaled intermediates under `dirs.upscaled_dir(type)`
    /// into the final on-disk resource at `dirs.output_dir(type)`.
    fn assemble(&self, name: &str, dirs: &WorkDirs) -> Result<PathBuf>;
}
