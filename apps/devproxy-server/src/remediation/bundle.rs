//! Derived config bundle: every route source concatenated in name order, with
//! losing declarations of conflicted routes commented out.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs as afs;

use devproxy_core::topology::{list_source_files, parse_source, source_name, RouteTopology};
use devproxy_core::TopologyError;

const BANNER: &str = "# generated by devproxy from the route sources; edits here are overwritten\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bundle {
    pub text: String,
    /// Hex sha256 of `text`.
    pub digest: String,
}

impl Bundle {
    fn new(text: String) -> Self {
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        Self { text, digest }
    }
}

/// Read every source file in `routes_dir` and render the bundle.
pub(crate) async fn render_dir(
    routes_dir: &Path,
    resolutions: &BTreeMap<String, String>,
) -> Result<Bundle, TopologyError> {
    let mut sources = Vec::new();
    for path in list_source_files(routes_dir)? {
        let text = afs::read_to_string(&path)
            .await
            .map_err(|source| TopologyError::Io {
                path: path.clone(),
                source,
            })?;
        sources.push((source_name(&path), text));
    }
    render(&sources, resolutions)
}

/// Render from `(file name, contents)` pairs already in name order.
///
/// Output is a pure function of the inputs: no timestamps, stable ordering.
pub(crate) fn render(
    sources: &[(String, String)],
    resolutions: &BTreeMap<String, String>,
) -> Result<Bundle, TopologyError> {
    let topology = RouteTopology::from_sources(sources.iter().map(|(n, t)| (n.as_str(), t.as_str())))?
        .with_resolutions(resolutions);

    let mut out = String::from(BANNER);
    for (name, text) in sources {
        out.push('\n');
        out.push_str("# source: ");
        out.push_str(name);
        out.push('\n');
        let body = drop_losers(&topology, name, text)?;
        out.push_str(&body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(Bundle::new(out))
}

fn drop_losers(topology: &RouteTopology, file: &str, text: &str) -> Result<String, TopologyError> {
    if topology.conflicts().is_empty() {
        return Ok(text.to_string());
    }
    let parsed = parse_source(file, text)?;
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for block in &parsed.locations {
        // Nested blocks inside an already dropped block are gone with it.
        if block.span.start < cursor || block.is_named() || block.proxy_pass().is_none() {
            continue;
        }
        let Some(conflict) = topology.conflict(&block.route) else {
            continue;
        };
        if conflict.winner == file {
            continue;
        }
        out.push_str(&text[cursor..block.span.start]);
        out.push_str(&format!(
            "# devproxy: dropped duplicate location {} (winner {})",
            block.route, conflict.winner
        ));
        cursor = block.span.end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// Write via a sibling temp file and rename, creating parent directories.
pub(crate) async fn save_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        afs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    afs::write(&tmp, bytes).await?;
    match afs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = afs::remove_file(path).await;
            let res = afs::rename(&tmp, path).await;
            if res.is_err() {
                let _ = afs::remove_file(&tmp).await;
            }
            res
        }
    }
}
