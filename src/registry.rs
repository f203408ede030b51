//! The image registry: the external collaborator that resolves an
//! image identity plus its transitive dependencies into an ordered
//! rendering plan (§4.F, §6). The registry itself is expected to
//! consult the blob store via `ReadStream`/`GetImageManifest`; this
//! crate only states the seam it renders against.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::CasError;
use crate::manifest::Label;

/// One element of a rendering plan: the blob to read, and the subset
/// of its paths to extract.
#[derive(Debug, Clone)]
pub struct RenderedAci {
    pub source_blob_key: String,
    pub file_map: HashSet<PathBuf>,
}

impl RenderedAci {
    pub fn new(source_blob_key: impl Into<String>, file_map: HashSet<PathBuf>) -> Self {
        Self {
            source_blob_key: source_blob_key.into(),
            file_map,
        }
    }
}

/// External dependency-resolution capability consumed by the tree
/// renderer. The list each method returns is assumed topologically
/// ordered and disjoint-by-construction on file-map paths; the
/// renderer does not cycle-check (§9) and surfaces a
/// `RenderOverwriteError`/`RenderOrderError` if that contract is
/// violated.
pub trait ImageRegistry {
    fn get_rendered_by_id(&self, key: &str) -> Result<Vec<RenderedAci>, CasError>;

    fn get_rendered_by_name_and_labels(
        &self,
        name: &str,
        labels: &[Label],
    ) -> Result<Vec<RenderedAci>, CasError>;

    fn get_rendered_from_list(&self, images: &[String]) -> Result<Vec<RenderedAci>, CasError>;
}

/// The optional secondary blob source named in §6 and Design Note 9
/// ("IPFS secondary source"). Deliberately out of core scope: no
/// implementation against a real network endpoint is shipped, only
/// the seam a caller may plug in. Its absence is non-fatal.
pub trait SecondaryBlobSource: Send + Sync {
    fn fetch_by_digest(&self, full_key: &str) -> Result<Option<Box<dyn std::io::Read>>, CasError>;
}
