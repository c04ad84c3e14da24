//! Parsing of the KFD topology `properties` files.
//!
//! Each node under `/sys/class/kfd/kfd/topology/nodes/` carries a
//! `properties` file of whitespace separated `<name> <value>` lines. GPU
//! nodes report the minor number of their render node and the unique ID of
//! the physical GPU they belong to; CPU nodes report neither and are
//! skipped.

use crate::error::TopologyParseError;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

const DRM_RENDER_MINOR: &str = "drm_render_minor";
const UNIQUE_ID: &str = "unique_id";

/// Render minor and unique ID of one topology node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProperties {
    pub render_minor: u32,
    /// Lower-case hexadecimal, no prefix.
    pub unique_id: String,
}

/// Returns the value of the first line whose key is exactly `key`.
pub fn find_property<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? == key {
            fields.next()
        } else {
            None
        }
    })
}

pub fn parse_node_properties(content: &str) -> Result<NodeProperties, TopologyParseError> {
    let minor = find_property(content, DRM_RENDER_MINOR).ok_or(
        TopologyParseError::MissingProperty {
            key: DRM_RENDER_MINOR,
        },
    )?;
    let render_minor = minor
        .parse::<i64>()
        .ok()
        .filter(|m| *m > 0 && *m <= i64::from(i32::MAX))
        .ok_or_else(|| TopologyParseError::InvalidProperty {
            key: DRM_RENDER_MINOR,
            value: minor.to_string(),
        })?;

    let unique_id = find_property(content, UNIQUE_ID)
        .ok_or(TopologyParseError::MissingProperty { key: UNIQUE_ID })?;
    if unique_id.is_empty() || !unique_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TopologyParseError::InvalidProperty {
            key: UNIQUE_ID,
            value: unique_id.to_string(),
        });
    }

    Ok(NodeProperties {
        render_minor: render_minor as u32,
        unique_id: unique_id_hex(unique_id),
    })
}

/// The kernel reports unique IDs in decimal; everything user facing uses hex.
/// Values that do not fit in 64 bits are kept verbatim.
pub fn unique_id_hex(decimal: &str) -> String {
    match decimal.parse::<u64>() {
        Ok(value) => format!("{value:x}"),
        Err(_) => decimal.to_ascii_lowercase(),
    }
}

/// Maps render minor to unique ID for every usable node under `nodes_dir`.
///
/// Nodes that cannot be read or lack either property are skipped. An
/// unreadable `nodes_dir` yields an empty map.
pub fn read_topology(nodes_dir: &Path) -> BTreeMap<u32, String> {
    let mut render_ids = BTreeMap::new();

    let walker = WalkDir::new(nodes_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Failed to list topology nodes in {:?}: {}", nodes_dir, err);
                break;
            }
        };

        let properties = entry.path().join("properties");
        debug!("Parsing {:?}", properties);
        let content = match std::fs::read_to_string(&properties) {
            Ok(content) => content,
            Err(err) => {
                debug!("Skipping {:?}: {}", properties, err);
                continue;
            }
        };

        match parse_node_properties(&content) {
            Ok(node) => {
                render_ids.insert(node.render_minor, node.unique_id);
            }
            Err(err) => debug!("Skipping topology node {:?}: {}", entry.path(), err),
        }
    }

    render_ids
}
