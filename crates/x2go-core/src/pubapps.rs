//! Published-applications menu parsing.
//!
//! The server-side `x2gogetapps` script emits a stream of shortened
//! .desktop entries, each wrapped in `<desktop>...</desktop>` and
//! optionally carrying a base64 `<icon>` block. This module dissects that
//! stream and builds a categorized, locale-aware menu tree.

use std::collections::BTreeMap;

use tracing::debug;

/// The fixed category set menus are bucketed into.
pub const CATEGORIES: &[&str] = &[
    "Multimedia",
    "Development",
    "Education",
    "Games",
    "Graphics",
    "Internet",
    "Office",
    "System",
    "Utilities",
    "Other Applications",
    "TOP",
];

/// Category for entries without a usable `Categories` line.
pub const CATEGORY_OTHER: &str = "Other Applications";

/// Category of entries rendered at the top menu level.
pub const CATEGORY_TOP: &str = "TOP";

/// One raw menu element: shortened .desktop text plus optional icon data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMenuItem {
    /// The .desktop text with the icon block removed.
    pub desktop: String,
    /// Base64-encoded icon data, if the entry carried one.
    pub icon: Option<String>,
}

/// One resolved menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    /// Display name, locale-resolved.
    pub name: String,
    /// Tooltip comment, falling back to the display name.
    pub comment: String,
    /// Command to execute on the server, placeholders stripped.
    pub exec: String,
    /// Base64-encoded icon data.
    pub icon: Option<String>,
}

/// A per-category menu tree for one locale.
pub type MenuTree = BTreeMap<String, Vec<MenuEntry>>;

/// Split raw `x2gogetapps` output into menu elements.
///
/// Each element is delimited by `</desktop>`; an embedded
/// `<icon>...</icon>` block is cut out and kept separately.
pub fn split_raw_menu(raw: &str) -> Vec<RawMenuItem> {
    let mut items = Vec::new();
    for block in raw.split("</desktop>\n") {
        let block = block.replace("<desktop>\n", "");
        let (desktop, icon) = match (block.split_once("<icon>\n"), block.contains("</icon>")) {
            (Some((head, rest)), true) => {
                let (icon, tail) = rest.split_once("</icon>\n").unwrap_or((rest, ""));
                (format!("{head}{tail}"), Some(icon.trim().to_owned()))
            }
            _ => (block, None),
        };
        if !desktop.trim().is_empty() {
            items.push(RawMenuItem { desktop, icon });
        }
    }
    items
}

/// Build the categorized menu tree for one locale.
///
/// Entries without an `Exec` line are dropped. If the whole menu would fit
/// under `max_submenus` entries everything is flattened into the TOP
/// category instead of being split into submenus. Entries within each
/// category are sorted by display name.
pub fn build_menu(items: &[RawMenuItem], lang: &str, max_submenus: usize) -> MenuTree {
    let render_submenus = items.len() > max_submenus;
    let mut tree: MenuTree = BTreeMap::new();

    for item in items {
        let Some(entry) = parse_entry(item, lang) else {
            continue;
        };
        let category = if render_submenus {
            entry.1
        } else {
            CATEGORY_TOP.to_owned()
        };
        tree.entry(category).or_default().push(entry.0);
    }

    for entries in tree.values_mut() {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
    }
    debug!(
        lang,
        entries = items.len(),
        categories = tree.len(),
        flattened = !render_submenus,
        "built published applications menu"
    );
    tree
}

fn parse_entry(item: &RawMenuItem, lang: &str) -> Option<(MenuEntry, String)> {
    let lang_region = lang;
    let lang_only = lang.split('_').next().unwrap_or(lang);

    let mut name = String::new();
    let mut fallback_name = String::new();
    let mut comment = String::new();
    let mut fallback_comment = String::new();
    let mut exec = String::new();
    let mut category = String::new();
    let mut terminal = false;

    for line in item.desktop.lines() {
        if let Some(value) = localized_value(line, "Name", lang_region, lang_only) {
            name = value;
        } else if let Some(value) = line.strip_prefix("Name=") {
            fallback_name = value.trim().to_owned();
        } else if let Some(value) = localized_value(line, "Comment", lang_region, lang_only) {
            comment = value;
        } else if let Some(value) = line.strip_prefix("Comment=") {
            fallback_comment = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("Exec=") {
            exec = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("Terminal=") {
            terminal = value.trim().eq_ignore_ascii_case("true");
        } else if let Some(value) = line.strip_prefix("Categories=") {
            if let Some(cat) = map_category(value) {
                category = cat.to_owned();
            }
        }
    }

    if exec.is_empty() {
        return None;
    }

    // strip freedesktop field codes, the server cannot fill them in
    for placeholder in ["%f", "%F", "%u", "%U"] {
        exec = exec.replace(placeholder, "");
    }
    let exec = exec.trim().to_owned();
    let exec = if terminal {
        format!("x-terminal-emulator -e '{exec}'")
    } else {
        exec
    };

    if name.is_empty() {
        name = fallback_name;
    }
    if comment.is_empty() {
        comment = fallback_comment;
    }
    if comment.is_empty() {
        comment = name.clone();
    }
    if category.is_empty() {
        category = CATEGORY_OTHER.to_owned();
    }

    Some((
        MenuEntry {
            name,
            comment,
            exec,
            icon: item.icon.clone(),
        },
        category,
    ))
}

fn localized_value(line: &str, key: &str, lang_region: &str, lang_only: &str) -> Option<String> {
    for lang in [lang_region, lang_only] {
        if let Some(value) = line.strip_prefix(&format!("{key}[{lang}]=")) {
            return Some(value.trim().to_owned());
        }
    }
    None
}

fn map_category(categories: &str) -> Option<&'static str> {
    if categories.contains("X2Go-Top") {
        Some(CATEGORY_TOP)
    } else if categories.contains("Audio") || categories.contains("Video") {
        Some("Multimedia")
    } else if categories.contains("Development") {
        Some("Development")
    } else if categories.contains("Education") {
        Some("Education")
    } else if categories.contains("Game") {
        Some("Games")
    } else if categories.contains("Graphics") {
        Some("Graphics")
    } else if categories.contains("Network") {
        Some("Internet")
    } else if categories.contains("Office") {
        Some("Office")
    } else if categories.contains("Settings") {
        // settings tools are not exposed through the published menu
        None
    } else if categories.contains("System") {
        Some("System")
    } else if categories.contains("Utility") {
        Some("Utilities")
    } else {
        Some(CATEGORY_OTHER)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_two_blocks() -> String {
        concat!(
            "<desktop>\n",
            "Name=Text Editor\n",
            "Name[de]=Texteditor\n",
            "Comment=Edit text files\n",
            "Exec=gedit %U\n",
            "<icon>\n",
            "aWNvbmRhdGE=\n",
            "</icon>\n",
            "</desktop>\n",
            "<desktop>\n",
            "Name=Calculator\n",
            "Exec=gnome-calculator\n",
            "</desktop>\n",
        )
        .to_owned()
    }

    #[test]
    fn split_extracts_icon_blocks() {
        let items = split_raw_menu(&raw_two_blocks());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].icon.as_deref(), Some("aWNvbmRhdGE="));
        assert!(items[1].icon.is_none());
        assert!(!items[0].desktop.contains("<icon>"));
    }

    #[test]
    fn two_blocks_without_categories_land_in_other() {
        let items = split_raw_menu(&raw_two_blocks());
        let tree = build_menu(&items, "en_US", 0);
        let other = tree.get(CATEGORY_OTHER).unwrap();
        assert_eq!(other.len(), 2);
        // sorted by name, Calculator first
        assert_eq!(other[0].name, "Calculator");
        assert_eq!(other[1].name, "Text Editor");
        assert!(other[1].icon.is_some());
        assert!(other[0].icon.is_none());
    }

    #[test]
    fn locale_precedence_over_fallback_name() {
        let items = split_raw_menu(&raw_two_blocks());
        let tree = build_menu(&items, "de_DE", 0);
        let other = tree.get(CATEGORY_OTHER).unwrap();
        assert!(other.iter().any(|e| e.name == "Texteditor"));
    }

    #[test]
    fn small_menus_flatten_to_top() {
        let items = split_raw_menu(&raw_two_blocks());
        let tree = build_menu(&items, "en_US", 10);
        assert!(tree.contains_key(CATEGORY_TOP));
        assert!(!tree.contains_key(CATEGORY_OTHER));
        assert_eq!(tree[CATEGORY_TOP].len(), 2);
    }

    #[test]
    fn exec_placeholders_are_stripped() {
        let items = split_raw_menu(&raw_two_blocks());
        let tree = build_menu(&items, "en_US", 0);
        let editor = tree[CATEGORY_OTHER]
            .iter()
            .find(|e| e.name == "Text Editor")
            .unwrap();
        assert_eq!(editor.exec, "gedit");
    }

    #[test]
    fn terminal_entries_get_wrapped() {
        let raw = "<desktop>\nName=Htop\nExec=htop\nTerminal=true\nCategories=System;\n</desktop>\n";
        let tree = build_menu(&split_raw_menu(raw), "en_US", 0);
        assert_eq!(tree["System"][0].exec, "x-terminal-emulator -e 'htop'");
    }

    #[test]
    fn category_mapping() {
        for (cats, expected) in [
            ("AudioVideo;Player;", "Multimedia"),
            ("Network;WebBrowser;", "Internet"),
            ("Utility;TextTools;", "Utilities"),
            ("X2Go-Top;", "TOP"),
            ("Unknown;", CATEGORY_OTHER),
        ] {
            let raw = format!("<desktop>\nName=App\nExec=app\nCategories={cats}\n</desktop>\n");
            let tree = build_menu(&split_raw_menu(&raw), "en_US", 0);
            assert!(tree.contains_key(expected), "{cats} -> {expected}");
        }
    }

    #[test]
    fn settings_entries_fall_through_to_other() {
        let raw = "<desktop>\nName=Prefs\nExec=prefs\nCategories=Settings;\n</desktop>\n";
        let tree = build_menu(&split_raw_menu(raw), "en_US", 0);
        assert!(tree.contains_key(CATEGORY_OTHER));
    }

    #[test]
    fn entries_without_exec_are_dropped() {
        let raw = "<desktop>\nName=Broken\n</desktop>\n";
        let tree = build_menu(&split_raw_menu(raw), "en_US", 0);
        assert!(tree.is_empty());
    }

    #[test]
    fn comment_falls_back_to_name() {
        let raw = "<desktop>\nName=App\nExec=app\n</desktop>\n";
        let tree = build_menu(&split_raw_menu(raw), "en_US", 0);
        assert_eq!(tree[CATEGORY_OTHER][0].comment, "App");
    }
}
