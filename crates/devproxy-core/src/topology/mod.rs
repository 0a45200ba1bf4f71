//! Route topology: which routes exist, which upstream each forwards to, and
//! where declarations disagree.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod parse;
mod upstream;

pub use parse::{parse_source, Directive, LocationBlock, ParseError, ParsedFile};
pub use upstream::{path_depth, UpstreamKey};

/// File extension of route source files.
pub const SOURCE_EXTENSION: &str = "conf";

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("route `{route}` is not part of group `{key}`")]
    UnknownRoute { key: String, route: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One `(route, upstream, sourceFile)` triple extracted from a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDeclaration {
    pub route: String,
    pub upstream: String,
    pub source_file: String,
    pub upstream_key: String,
    pub line: usize,
}

impl RouteDeclaration {
    pub fn new(route: &str, upstream: &str, source_file: &str, line: usize) -> Self {
        Self {
            route: route.to_string(),
            upstream: upstream.to_string(),
            source_file: source_file.to_string(),
            upstream_key: UpstreamKey::normalize(upstream).to_string(),
            line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionMode {
    /// Hide path-prefix descendants of the promoted route declared in the same file.
    Children,
    /// Hide every other route of the group declared in the same file.
    Config,
}

/// Operator override of which sibling represents a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub base_key: String,
    pub source_file: String,
    pub route: String,
    pub mode: PromotionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub route: String,
    pub depth: usize,
    /// Every file declaring this route for this upstream, first-seen first.
    pub source_files: Vec<String>,
    pub conflicted: bool,
}

impl GroupMember {
    pub fn first_source(&self) -> &str {
        self.source_files.first().map(String::as_str).unwrap_or("")
    }

    fn declared_in(&self, file: &str) -> bool {
        self.source_files.iter().any(|f| f == file)
    }
}

/// Routes sharing one normalized upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroup {
    pub key: String,
    pub members: Vec<GroupMember>,
    pub promotion: Option<Promotion>,
}

impl RouteGroup {
    pub fn member(&self, route: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.route == route)
    }

    /// Members left visible once the promotion (if any) hides its siblings.
    pub fn visible_members(&self) -> Vec<&GroupMember> {
        let Some(promo) = &self.promotion else {
            return self.members.iter().collect();
        };
        self.members
            .iter()
            .filter(|m| {
                if m.route == promo.route || !m.declared_in(&promo.source_file) {
                    return true;
                }
                match promo.mode {
                    PromotionMode::Config => false,
                    PromotionMode::Children => !is_descendant(&m.route, &promo.route),
                }
            })
            .collect()
    }
}

fn is_descendant(route: &str, parent: &str) -> bool {
    if route == parent {
        return false;
    }
    if parent.ends_with('/') {
        route.starts_with(parent)
    } else {
        route
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Pick the group's representative route.
///
/// An existing promotion always wins. Otherwise a parent exists only when exactly
/// one member has the minimal path depth and that member is not conflicted.
pub fn resolve_parent(group: &RouteGroup) -> Option<&str> {
    if let Some(promo) = &group.promotion {
        return Some(promo.route.as_str());
    }
    let min_depth = group.members.iter().map(|m| m.depth).min()?;
    let mut shallowest = group.members.iter().filter(|m| m.depth == min_depth);
    match (shallowest.next(), shallowest.next()) {
        (Some(only), None) if !only.conflicted => Some(only.route.as_str()),
        _ => None,
    }
}

/// A route declared by more than one file with mismatched upstreams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub route: String,
    /// All declarations of the route, first-seen first.
    pub declarations: Vec<RouteDeclaration>,
    pub upstream_keys: Vec<String>,
    /// File whose declaration the derived bundle keeps.
    pub winner: String,
    /// True when `winner` came from an operator resolution rather than first-seen order.
    pub resolved: bool,
}

impl Conflict {
    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for decl in &self.declarations {
            if !files.contains(&decl.source_file.as_str()) {
                files.push(decl.source_file.as_str());
            }
        }
        files
    }
}

/// Derived, normalized view over every route source file.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTopology {
    declarations: Vec<RouteDeclaration>,
    groups: Vec<RouteGroup>,
    conflicts: Vec<Conflict>,
    #[serde(skip)]
    resolutions: BTreeMap<String, String>,
}

impl RouteTopology {
    /// Parse every `*.conf` file directly inside `dir`, in file-name order.
    ///
    /// Any parse error aborts the whole build.
    pub fn build(dir: &Path) -> Result<Self, TopologyError> {
        let files = list_source_files(dir)?;
        let mut declarations = Vec::new();
        for path in &files {
            let text = std::fs::read_to_string(path).map_err(|source| TopologyError::Io {
                path: path.clone(),
                source,
            })?;
            let name = source_name(path);
            declarations.extend(declarations_from_source(&name, &text)?);
        }
        debug!(
            dir = %dir.display(),
            files = files.len(),
            declarations = declarations.len(),
            "route topology built"
        );
        Ok(Self::from_declarations(declarations))
    }

    /// Build from in-memory `(file name, contents)` pairs, in the given order.
    pub fn from_sources<'a, I>(sources: I) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut declarations = Vec::new();
        for (name, text) in sources {
            declarations.extend(declarations_from_source(name, text)?);
        }
        Ok(Self::from_declarations(declarations))
    }

    pub fn from_declarations(declarations: Vec<RouteDeclaration>) -> Self {
        let mut topology = Self {
            declarations,
            groups: Vec::new(),
            conflicts: Vec::new(),
            resolutions: BTreeMap::new(),
        };
        topology.derive();
        topology
    }

    fn derive(&mut self) {
        let mut by_route: Vec<(String, Vec<usize>)> = Vec::new();
        let mut route_index: HashMap<&str, usize> = HashMap::new();
        for (idx, decl) in self.declarations.iter().enumerate() {
            match route_index.get(decl.route.as_str()) {
                Some(&slot) => by_route[slot].1.push(idx),
                None => {
                    route_index.insert(decl.route.as_str(), by_route.len());
                    by_route.push((decl.route.clone(), vec![idx]));
                }
            }
        }

        let mut conflicts = Vec::new();
        for (route, idxs) in &by_route {
            let decls: Vec<&RouteDeclaration> = idxs.iter().map(|&i| &self.declarations[i]).collect();
            let files: Vec<&str> = decls.iter().map(|d| d.source_file.as_str()).collect();
            let mut keys: Vec<String> = Vec::new();
            for d in &decls {
                if !keys.contains(&d.upstream_key) {
                    keys.push(d.upstream_key.clone());
                }
            }
            let distinct_files = {
                let mut f = files.clone();
                f.sort_unstable();
                f.dedup();
                f.len()
            };
            if distinct_files > 1 && keys.len() > 1 {
                let resolution = self
                    .resolutions
                    .get(route)
                    .filter(|file| decls.iter().any(|d| &d.source_file == *file));
                conflicts.push(Conflict {
                    route: route.clone(),
                    declarations: decls.iter().map(|d| (*d).clone()).collect(),
                    upstream_keys: keys,
                    winner: resolution
                        .cloned()
                        .unwrap_or_else(|| decls[0].source_file.clone()),
                    resolved: resolution.is_some(),
                });
            }
        }

        let conflicted: Vec<&str> = conflicts.iter().map(|c| c.route.as_str()).collect();
        let mut groups: Vec<RouteGroup> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        for decl in &self.declarations {
            let slot = *group_index
                .entry(decl.upstream_key.clone())
                .or_insert_with(|| {
                    groups.push(RouteGroup {
                        key: decl.upstream_key.clone(),
                        members: Vec::new(),
                        promotion: None,
                    });
                    groups.len() - 1
                });
            let group = &mut groups[slot];
            match group.members.iter_mut().find(|m| m.route == decl.route) {
                Some(member) => {
                    if !member.source_files.contains(&decl.source_file) {
                        member.source_files.push(decl.source_file.clone());
                    }
                }
                None => group.members.push(GroupMember {
                    route: decl.route.clone(),
                    depth: path_depth(&decl.route),
                    source_files: vec![decl.source_file.clone()],
                    conflicted: conflicted.contains(&decl.route.as_str()),
                }),
            }
        }

        // Keep promotions across re-derivation when still valid.
        for group in &mut groups {
            if let Some(old) = self.groups.iter().find(|g| g.key == group.key) {
                if let Some(promo) = &old.promotion {
                    if group.member(&promo.route).is_some() {
                        group.promotion = Some(promo.clone());
                    }
                }
            }
        }

        self.conflicts = conflicts;
        self.groups = groups;
    }

    pub fn declarations(&self) -> &[RouteDeclaration] {
        &self.declarations
    }

    pub fn groups(&self) -> &[RouteGroup] {
        &self.groups
    }

    pub fn group(&self, key: &str) -> Option<&RouteGroup> {
        self.groups.iter().find(|g| g.key == key)
    }

    /// Every route declared in more than one file with mismatched upstreams.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn conflict(&self, route: &str) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.route == route)
    }

    pub fn parent(&self, key: &str) -> Option<&str> {
        self.group(key).and_then(resolve_parent)
    }

    /// All declarations of `route`, first-seen first.
    pub fn declarations_for(&self, route: &str) -> Vec<&RouteDeclaration> {
        self.declarations
            .iter()
            .filter(|d| d.route == route)
            .collect()
    }

    /// The declaration that is live for `route`: the conflict winner when the
    /// route is conflicted, otherwise the first declaration.
    pub fn effective_declaration(&self, route: &str) -> Option<&RouteDeclaration> {
        match self.conflict(route) {
            Some(conflict) => self
                .declarations
                .iter()
                .find(|d| d.route == route && d.source_file == conflict.winner),
            None => self.declarations.iter().find(|d| d.route == route),
        }
    }

    /// Promote `route` as the representative of the group keyed by `base_key`.
    pub fn promote(
        &mut self,
        mode: PromotionMode,
        base_key: &str,
        route: &str,
    ) -> Result<Promotion, TopologyError> {
        let unknown = || TopologyError::UnknownRoute {
            key: base_key.to_string(),
            route: route.to_string(),
        };
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.key == base_key)
            .ok_or_else(unknown)?;
        let member = group.member(route).ok_or_else(unknown)?;
        let promotion = Promotion {
            base_key: base_key.to_string(),
            source_file: member.first_source().to_string(),
            route: route.to_string(),
            mode,
        };
        group.promotion = Some(promotion.clone());
        Ok(promotion)
    }

    pub fn clear_promotion(&mut self, base_key: &str) -> Option<Promotion> {
        self.groups
            .iter_mut()
            .find(|g| g.key == base_key)
            .and_then(|g| g.promotion.take())
    }

    /// Re-apply persisted promotions after a rebuild; stale ones are dropped.
    pub fn with_promotions(mut self, promotions: &[Promotion]) -> Self {
        for promo in promotions {
            if let Err(err) = self.promote(promo.mode, &promo.base_key, &promo.route) {
                warn!(%err, "dropping stale promotion");
            }
        }
        self
    }

    /// Choose which file's declaration of a conflicted route the bundle keeps.
    pub fn resolve_conflict(&mut self, route: &str, winner_file: &str) -> Result<(), TopologyError> {
        let declared = self
            .conflict(route)
            .is_some_and(|c| c.declarations.iter().any(|d| d.source_file == winner_file));
        if !declared {
            return Err(TopologyError::UnknownRoute {
                key: winner_file.to_string(),
                route: route.to_string(),
            });
        }
        self.resolutions
            .insert(route.to_string(), winner_file.to_string());
        self.derive();
        Ok(())
    }

    /// Re-apply persisted conflict resolutions; stale ones are dropped.
    pub fn with_resolutions(mut self, resolutions: &BTreeMap<String, String>) -> Self {
        for (route, file) in resolutions {
            if let Err(err) = self.resolve_conflict(route, file) {
                warn!(%err, "dropping stale conflict resolution");
            }
        }
        self
    }

    pub fn resolutions(&self) -> &BTreeMap<String, String> {
        &self.resolutions
    }
}

/// Extract route declarations from one source file.
pub fn declarations_from_source(
    file: &str,
    text: &str,
) -> Result<Vec<RouteDeclaration>, ParseError> {
    let parsed = parse_source(file, text)?;
    Ok(parsed
        .locations
        .iter()
        .filter(|loc| !loc.is_named())
        .filter_map(|loc| {
            loc.proxy_pass()
                .map(|upstream| RouteDeclaration::new(&loc.route, upstream, file, loc.line))
        })
        .collect())
}

/// Route source files directly inside `dir`, sorted by file name.
pub fn list_source_files(dir: &Path) -> Result<Vec<PathBuf>, TopologyError> {
    let entries = std::fs::read_dir(dir).map_err(|source| TopologyError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TopologyError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Name a source file is reported under (its file name).
pub fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
