//! Snapshot tag construction.
//!
//! The snapshotter treats a comma inside a `--tag` value as a list
//! separator, so commas in game names are rewritten to underscores before
//! the name is used as a tag. Only the game-name tag is sanitized; trigger
//! and custom tags are configuration literals passed through as-is.

/// Replace commas so the value survives as a single tag.
pub fn sanitize_tag(value: &str) -> String {
    value.replace(',', "_")
}

/// Assemble the tag list for one snapshot: the sanitized game name first,
/// then the trigger tag (if any), then extra tags in their given order.
/// Duplicates are deliberately preserved.
pub fn build_tags(game_name: &str, trigger_tag: Option<&str>, extra_tags: &[String]) -> Vec<String> {
    let mut tags = Vec::with_capacity(2 + extra_tags.len());
    tags.push(sanitize_tag(game_name));
    if let Some(tag) = trigger_tag {
        tags.push(tag.to_string());
    }
    tags.extend(extra_tags.iter().cloned());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_every_comma() {
        assert_eq!(sanitize_tag("Game, The"), "Game_ The");
        assert_eq!(sanitize_tag("a,b,c"), "a_b_c");
        assert_eq!(sanitize_tag("no commas"), "no commas");
    }

    #[test]
    fn test_build_tags_order() {
        let tags = build_tags(
            "Baldur's Gate, Enhanced",
            Some("stop"),
            &["modded".to_string(), "coop".to_string()],
        );
        assert_eq!(tags, vec!["Baldur's Gate_ Enhanced", "stop", "modded", "coop"]);
    }

    #[test]
    fn test_build_tags_without_trigger() {
        let tags = build_tags("Celeste", None, &[]);
        assert_eq!(tags, vec!["Celeste"]);
    }

    #[test]
    fn test_build_tags_keeps_duplicates() {
        let tags = build_tags("stop", Some("stop"), &["stop".to_string()]);
        assert_eq!(tags, vec!["stop", "stop", "stop"]);
    }
}
