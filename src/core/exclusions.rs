use crate::core::models::RemotePath;

/// Ordered set of excluded path prefixes, relative to the migration root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    prefixes: Vec<RemotePath>,
}

impl ExclusionSet {
    /// Build from configured strings. Duplicates are dropped and the first
    /// occurrence keeps its position.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for raw in prefixes {
            let prefix = RemotePath::parse(raw.as_ref().trim());
            if !prefix.is_root() && !set.prefixes.contains(&prefix) {
                set.prefixes.push(prefix);
            }
        }
        set
    }

    pub fn is_excluded(&self, path: &RemotePath) -> bool {
        self.matching_prefix(path).is_some()
    }

    /// The first configured prefix that covers `path`.
    pub fn matching_prefix(&self, path: &RemotePath) -> Option<&RemotePath> {
        self.prefixes.iter().find(|prefix| path.starts_with(prefix))
    }

    pub fn prefixes(&self) -> &[RemotePath] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excludes_prefix_and_descendants() {
        let set = ExclusionSet::new(["Z_Dropbox", "Photos/Raw"]);

        assert!(set.is_excluded(&RemotePath::parse("Z_Dropbox")));
        assert!(set.is_excluded(&RemotePath::parse("Z_Dropbox/x.bin")));
        assert!(set.is_excluded(&RemotePath::parse("Photos/Raw/img.cr2")));
        assert!(!set.is_excluded(&RemotePath::parse("Photos/Edited/img.jpg")));
        assert!(!set.is_excluded(&RemotePath::parse("doc.txt")));
    }

    #[test]
    fn test_no_substring_matches() {
        let set = ExclusionSet::new(["Z_Dropbox"]);
        assert!(!set.is_excluded(&RemotePath::parse("Z_Dropbox2/file")));
        assert!(!set.is_excluded(&RemotePath::parse("Z_Drop")));
    }

    #[test]
    fn test_root_and_duplicate_prefixes_are_ignored() {
        let set = ExclusionSet::new(["/", "", "a/b", "/a/b/"]);
        assert_eq!(set.prefixes().len(), 1);
        assert!(!set.is_excluded(&RemotePath::parse("c.txt")));
    }

    #[test]
    fn test_matching_prefix_reports_first_match_in_order() {
        let set = ExclusionSet::new(["a", "a/b"]);
        let hit = set.matching_prefix(&RemotePath::parse("a/b/c")).unwrap();
        assert_eq!(hit.to_string(), "a");
    }
}
