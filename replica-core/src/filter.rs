use crate::{options::Pattern, path::DirectoryPath};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Runtime filter compiled from include / exclude pattern lists.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self {
            include: GlobSet::empty(),
            exclude: GlobSet::empty(),
        }
    }
}

fn compile(patterns: &[Pattern]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    // compile patterns, ignore compile errors individually
    for pat in patterns {
        match Glob::new(&pat.0) {
            Ok(g) => {
                builder.add(g);
            }
            Err(e) => tracing::warn!(pattern = %pat.0, "ignoring bad pattern: {e}"),
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

impl PathFilter {
    /// Build a filter from lists. Empty include list means "include all".
    pub fn new(include: &[Pattern], exclude: &[Pattern]) -> Self {
        Self {
            include: compile(include),
            exclude: compile(exclude),
        }
    }

    /// Whether a root-relative path should be replicated. A path below an
    /// excluded directory is excluded as well.
    pub fn check(&self, rel: &DirectoryPath) -> bool {
        let path = rel.relative_str();
        let included = self.include.is_empty() || self.include.is_match(path);
        included && !self.excluded_with_ancestors(path)
    }

    fn excluded_with_ancestors(&self, path: &str) -> bool {
        if self.exclude.is_empty() {
            return false;
        }
        path.match_indices('/')
            .map(|(idx, _)| &path[..idx])
            .chain(std::iter::once(path))
            .any(|prefix| self.exclude.is_match(prefix))
    }

    /// Whether the walk should descend into a directory. Include patterns
    /// name files, so only exclusion prunes a subtree.
    pub fn check_dir(&self, rel: &DirectoryPath) -> bool {
        !self.exclude.is_match(rel.relative_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DirectoryPath {
        DirectoryPath::parse(s).unwrap()
    }

    #[test]
    fn test_filter_basic() {
        let include = vec![Pattern("**/*.rs".into())];
        let exclude = vec![Pattern("tests/**".into())];
        let filter = PathFilter::new(&include, &exclude);
        assert!(filter.check(&p("/src/lib.rs")));
        assert!(!filter.check(&p("/tests/main.rs")));
        assert!(!filter.check(&p("/README.md")));
        assert!(filter.check_dir(&p("/src")));
    }

    #[test]
    fn excluded_directories_are_pruned() {
        let filter = PathFilter::new(&[], &[Pattern("target".into()), Pattern("[".into())]);
        assert!(!filter.check_dir(&p("/target")));
        assert!(!filter.check(&p("/target/debug/app")));
        assert!(filter.check(&p("/anything/else")));
        assert!(PathFilter::default().check(&p("/x")));
    }
}
