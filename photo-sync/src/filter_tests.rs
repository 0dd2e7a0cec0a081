//! Property tests for photo filtering

use crate::filter::{PhotoFilter, DEFAULT_PHOTO_EXTENSIONS};
use proptest::prelude::*;
use std::path::PathBuf;

fn mixed_case(s: &str, mask: &[bool]) -> String {
    s.chars()
        .zip(mask.iter().cycle())
        .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c })
        .collect()
}

proptest! {
    #[test]
    fn test_photo_extensions_match_in_any_case(
        dirs in prop::collection::vec("[a-zA-Z0-9_\\-]{1,12}", 0..4),
        stem in "[a-zA-Z0-9_\\-]{1,20}",
        ext_index in 0..DEFAULT_PHOTO_EXTENSIONS.len(),
        mask in prop::collection::vec(any::<bool>(), 1..6),
    ) {
        let filter = PhotoFilter::photos().unwrap();
        let ext = mixed_case(DEFAULT_PHOTO_EXTENSIONS[ext_index], &mask);

        let mut path: PathBuf = dirs.iter().collect();
        path.push(format!("{}.{}", stem, ext));

        prop_assert!(filter.matches(&path), "path: {}", path.display());
    }

    #[test]
    fn test_hidden_component_never_matches(
        dirs in prop::collection::vec("[a-zA-Z0-9_\\-]{1,12}", 1..4),
        hidden_at in 0usize..4,
        stem in "[a-zA-Z0-9_\\-]{1,20}",
    ) {
        let filter = PhotoFilter::photos().unwrap();
        let hidden_at = hidden_at % (dirs.len() + 1);

        let mut path = PathBuf::new();
        for (i, dir) in dirs.iter().enumerate() {
            if i == hidden_at {
                path.push(format!(".{}", dir));
            } else {
                path.push(dir);
            }
        }
        if hidden_at == dirs.len() {
            path.push(format!(".{}.jpg", stem));
        } else {
            path.push(format!("{}.jpg", stem));
        }

        prop_assert!(!filter.matches(&path), "path: {}", path.display());
    }

    #[test]
    fn test_other_extensions_never_match(
        stem in "[a-zA-Z0-9_\\-]{1,20}",
        ext in "[a-z]{1,5}",
    ) {
        prop_assume!(!DEFAULT_PHOTO_EXTENSIONS.contains(&ext.as_str()));
        let filter = PhotoFilter::photos().unwrap();

        let path = PathBuf::from(format!("{}.{}", stem, ext));
        prop_assert!(!filter.matches(&path));
    }

    #[test]
    fn test_excluded_directory_wins_over_extension(
        dir in "[a-z]{1,10}",
        stem in "[a-zA-Z0-9_]{1,20}",
    ) {
        prop_assume!(dir != "rejects");
        let filter = PhotoFilter::new(&["jpg"], &["**/rejects/**"]).unwrap();

        let kept = PathBuf::from(&dir).join(format!("{}.jpg", stem));
        let rejected = PathBuf::from(&dir).join("rejects").join(format!("{}.jpg", stem));

        prop_assert!(filter.matches(&kept));
        prop_assert!(!filter.matches(&rejected));
    }
}
