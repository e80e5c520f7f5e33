// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output and color utilities for consistent terminal formatting
//!
//! Provides shared color functions respecting NO_COLOR environment variable.

use colored::Colorize;
use serde::Serialize;

/// Check if colors should be used (respects NO_COLOR env var)
pub fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

/// Colorize document id (cyan)
pub fn colorize_id(text: &str, use_color: bool) -> String {
    if use_color {
        text.cyan().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize score (yellow, three decimals)
pub fn colorize_score(score: f32, use_color: bool) -> String {
    let text = format!("{:.3}", score);
    if use_color {
        text.yellow().to_string()
    } else {
        text
    }
}

/// Colorize space/type facet (green)
pub fn colorize_facet(text: &str, use_color: bool) -> String {
    if use_color {
        text.green().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize title (bold)
pub fn colorize_title(text: &str, use_color: bool) -> String {
    if use_color {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize snippet lines (dimmed)
pub fn colorize_snippet(text: &str, use_color: bool) -> String {
    if use_color {
        text.dimmed().to_string()
    } else {
        text.to_string()
    }
}

/// Serialize `value` as pretty or compact JSON
pub fn to_json<T: Serialize>(value: &T, compact: bool) -> serde_json::Result<String> {
    if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_output_without_color() {
        assert_eq!(colorize_id("DOC-1", false), "DOC-1");
        assert_eq!(colorize_score(0.12345, false), "0.123");
        assert_eq!(colorize_facet("ENG", false), "ENG");
        assert_eq!(colorize_title("Title", false), "Title");
        assert_eq!(colorize_snippet("text", false), "text");
    }

    #[test]
    fn compact_json_is_single_line() {
        let value = serde_json::json!({"a": [1, 2]});
        assert_eq!(to_json(&value, true).unwrap(), "{\"a\":[1,2]}");
        assert!(to_json(&value, false).unwrap().contains('\n'));
    }
}
