use crate::args::PathMapping;

/// Translates source paths between the editor's file system and the
/// debuggee's. The longest matching root wins; unmatched paths pass through.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    mappings: Vec<PathMapping>,
    fold_case: bool,
}

fn normalize(path: &str) -> String {
    let mut out = path.replace('\\', "/");
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn separator_of(root: &str) -> char {
    if root.contains('\\') && !root.contains('/') {
        '\\'
    } else {
        '/'
    }
}

impl PathMapper {
    pub fn new(mappings: Vec<PathMapping>, fold_case: bool) -> Self {
        Self {
            mappings,
            fold_case,
        }
    }

    /// Key under which breakpoints for `path` are tracked.
    pub fn key(&self, path: &str) -> String {
        let normalized = normalize(path);
        if self.fold_case {
            normalized.to_lowercase()
        } else {
            normalized
        }
    }

    pub fn to_remote(&self, local: &str) -> String {
        self.translate(local, |m| (&m.local_root, &m.remote_root))
    }

    pub fn to_local(&self, remote: &str) -> String {
        self.translate(remote, |m| (&m.remote_root, &m.local_root))
    }

    fn translate<'a>(
        &'a self,
        path: &str,
        roots: impl Fn(&'a PathMapping) -> (&'a String, &'a String),
    ) -> String {
        let normalized = normalize(path);
        let compare_path = self.key(path);

        let mut best: Option<(usize, &String)> = None;
        for mapping in &self.mappings {
            let (from, to) = roots(mapping);
            let from_key = self.key(from);
            let matches = compare_path == from_key
                || (compare_path.starts_with(&from_key)
                    && (from_key.ends_with('/')
                        || compare_path[from_key.len()..].starts_with('/')));
            if !matches {
                continue;
            }
            if best.map_or(true, |(len, _)| from_key.len() > len) {
                best = Some((from_key.len(), to));
            }
        }

        let Some((prefix_len, to)) = best else {
            return path.to_string();
        };

        // `key` only lower-cases and normalises separators, which keeps byte
        // offsets aligned with `normalized` for ASCII roots. Fall back to the
        // original path if case folding changed the length.
        if normalized.len() != compare_path.len() {
            return path.to_string();
        }

        let rest = normalized[prefix_len..].trim_start_matches('/');
        let separator = separator_of(to);
        let target_root = to.trim_end_matches(['/', '\\']);
        if rest.is_empty() {
            return to.to_string();
        }
        let rest = if separator == '\\' {
            rest.replace('/', "\\")
        } else {
            rest.to_string()
        };
        format!("{target_root}{separator}{rest}")
    }
}
