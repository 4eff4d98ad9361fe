/// Decides which requested unit names enter the captured set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InclusionPolicy {
    /// Every requested name is recorded.
    All,
    /// Everything except the entry unit that was executed.
    ExcludeEntry(String),
}

impl InclusionPolicy {
    pub fn for_entry(entry: &str, include_entry: bool) -> Self {
        if include_entry {
            InclusionPolicy::All
        } else {
            InclusionPolicy::ExcludeEntry(entry.to_string())
        }
    }

    pub fn admits(&self, name: &str) -> bool {
        match self {
            InclusionPolicy::All => true,
            InclusionPolicy::ExcludeEntry(entry) => entry != name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_filtered_only_when_excluded() {
        let exclude = InclusionPolicy::for_entry("Demo", false);
        assert!(!exclude.admits("Demo"));
        assert!(exclude.admits("Demo$Helper"));

        let include = InclusionPolicy::for_entry("Demo", true);
        assert_eq!(include, InclusionPolicy::All);
        assert!(include.admits("Demo"));
    }
}
