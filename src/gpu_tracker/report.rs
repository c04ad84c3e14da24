//! Results of tracker operations and their console rendering.

use super::selector::GpuSelection;
use super::state::{Accessibility, GpuStatus};
use std::fmt;

const RULE_WIDTH: usize = 120;

pub(crate) struct GpuList<'a, T>(pub &'a [T]);

impl<T: fmt::Display> fmt::Display for GpuList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{item}")?;
        }
        write!(f, "]")
    }
}

fn write_invalid(f: &mut fmt::Formatter<'_>, selection: &GpuSelection) -> fmt::Result {
    if !selection.invalid_ranges.is_empty() {
        writeln!(
            f,
            "Ignoring {} GPUs Ranges as they are invalid",
            GpuList(&selection.invalid_ranges)
        )?;
    }
    if !selection.invalid.is_empty() {
        writeln!(f, "Ignoring {} GPUs as they are invalid", GpuList(&selection.invalid))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    Enabled,
    AlreadyEnabled,
}

impl fmt::Display for EnableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnableOutcome::Enabled => writeln!(f, "GPU Tracker has been enabled"),
            EnableOutcome::AlreadyEnabled => writeln!(f, "GPU Tracker is already enabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub was_enabled: bool,
}

impl fmt::Display for ResetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GPU Tracker has been reset")?;
        if self.was_enabled {
            writeln!(
                f,
                "Since GPU Tracker was enabled, it is recommended to stop and restart running containers to get the most accurate GPU Tracker status"
            )?;
        }
        Ok(())
    }
}

/// Result of a `status` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    Disabled,
    /// Stored topology no longer matches the host.
    Inconsistent,
    Active(Vec<(usize, GpuStatus)>),
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = match self {
            TrackerStatus::Disabled => return writeln!(f, "GPU Tracker is disabled"),
            TrackerStatus::Inconsistent => {
                return writeln!(f, "GPUs info is invalid. Please reset GPU Tracker.");
            }
            TrackerStatus::Active(rows) => rows,
        };

        let rule = "-".repeat(RULE_WIDTH);
        writeln!(f, "{rule}")?;
        writeln!(f, "{:<10}{:<25}{:<20}{:<65}", "GPU Id", "UUID", "Accessibility", "Container Ids")?;
        writeln!(f, "{rule}")?;

        for (gpu, status) in rows {
            let accessibility = status.accessibility.to_string();
            match status.container_ids.split_first() {
                None => writeln!(f, "{:<10}{:<25}{:<20}{:<65}", gpu, status.uuid, accessibility, "-")?,
                Some((first, rest)) => {
                    writeln!(f, "{:<10}{:<25}{:<20}{:<65}", gpu, status.uuid, accessibility, first)?;
                    for id in rest {
                        writeln!(f, "{:<10}{:<25}{:<20}{:<65}", "", "", "", id)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Result of changing GPU accessibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessibilityOutcome {
    Disabled,
    Inconsistent,
    Applied {
        mode: Accessibility,
        /// GPUs now in `mode`.
        converted: Vec<usize>,
        /// GPUs left shared because several containers hold them.
        skipped: Vec<usize>,
        selection: GpuSelection,
    },
}

impl fmt::Display for AccessibilityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessibilityOutcome::Disabled => writeln!(f, "GPU Tracker is disabled"),
            AccessibilityOutcome::Inconsistent => {
                writeln!(f, "GPUs info is invalid. Please reset GPU Tracker.")
            }
            AccessibilityOutcome::Applied {
                mode,
                converted,
                skipped,
                selection,
            } => {
                let mode_name = match mode {
                    Accessibility::Shared => "shared",
                    Accessibility::Exclusive => "exclusive",
                };
                if !converted.is_empty() {
                    writeln!(f, "GPUs {} have been made {}", GpuList(converted), mode_name)?;
                }
                if !skipped.is_empty() {
                    writeln!(
                        f,
                        "GPUs {} have not been made exclusive because more than one container is currently using it",
                        GpuList(skipped)
                    )?;
                }
                write_invalid(f, selection)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// No state file; nothing was held.
    NotInitialized,
    Released { container_id: String, gpus: Vec<usize> },
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseOutcome::Released { container_id, gpus } if !gpus.is_empty() => {
                writeln!(f, "Released GPUs {} used by container {}", GpuList(gpus), container_id)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_table() {
        let status = TrackerStatus::Active(vec![
            (
                0,
                GpuStatus {
                    uuid: "0xEF2C1799A1F3E2ED".into(),
                    partition_type: String::new(),
                    accessibility: Accessibility::Exclusive,
                    container_ids: vec!["c1".into(), "c2".into()],
                },
            ),
            (1, GpuStatus::default()),
        ]);

        let rendered = status.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "-".repeat(120));
        assert!(lines[1].starts_with("GPU Id    UUID                     Accessibility       Container Ids"));
        assert_eq!(lines[3].trim_end(), "0         0xEF2C1799A1F3E2ED       Exclusive           c1");
        assert_eq!(lines[4].trim_end(), format!("{}c2", " ".repeat(55)));
        assert_eq!(lines[5].trim_end(), format!("1{}Shared{}-", " ".repeat(34), " ".repeat(14)));
    }

    #[test]
    fn test_accessibility_messages() {
        let outcome = AccessibilityOutcome::Applied {
            mode: Accessibility::Exclusive,
            converted: vec![0, 1],
            skipped: vec![2],
            selection: GpuSelection {
                valid: vec![0, 1, 2],
                invalid: vec!["9".into()],
                invalid_ranges: vec!["3-1".into()],
            },
        };
        assert_eq!(
            outcome.to_string(),
            "GPUs [0, 1] have been made exclusive\n\
             GPUs [2] have not been made exclusive because more than one container is currently using it\n\
             Ignoring [3-1] GPUs Ranges as they are invalid\n\
             Ignoring [9] GPUs as they are invalid\n"
        );
    }

    #[test]
    fn test_reset_advice_only_when_enabled() {
        assert_eq!(ResetOutcome { was_enabled: false }.to_string(), "GPU Tracker has been reset\n");
        assert!(ResetOutcome { was_enabled: true }.to_string().contains("restart running containers"));
    }

    #[test]
    fn test_release_message() {
        let outcome = ReleaseOutcome::Released {
            container_id: "abc".into(),
            gpus: vec![0, 2],
        };
        assert_eq!(outcome.to_string(), "Released GPUs [0, 2] used by container abc\n");
        assert_eq!(ReleaseOutcome::NotInitialized.to_string(), "");
    }
}
