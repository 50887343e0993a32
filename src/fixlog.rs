use std::collections::HashSet;

use serde::Serialize;

pub const BLOCK_OPEN: &str = "[FIX]";
pub const BLOCK_CLOSE: &str = "[/FIX]";
const APPEND_SEPARATOR: &str = "\n---\n\n";
const REWRITE_SEPARATOR: &str = "\n\n---\n\n";

/// One applied fix as recorded in `luatools-fix-log-<id>.log`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    pub date: String,
    pub game: String,
    pub fix_type: String,
    pub download_url: String,
    pub files: Vec<String>,
}

impl FixRecord {
    /// Blocks without a date are corrupt and never listed.
    pub fn is_well_formed(&self) -> bool {
        !self.date.is_empty()
    }

    pub fn render(&self) -> String {
        let mut block = format!(
            "{BLOCK_OPEN}\nDate: {}\nGame: {}\nFix Type: {}\nDownload URL: {}\nFiles:\n",
            self.date, self.game, self.fix_type, self.download_url
        );
        for file in &self.files {
            block.push_str(file);
            block.push('\n');
        }
        block.push_str(BLOCK_CLOSE);
        block.push('\n');
        block
    }
}

/// Appends `record` after `existing`, keeping everything already there.
pub fn append_block(existing: &str, record: &FixRecord) -> String {
    if existing.trim().is_empty() {
        return record.render();
    }
    let newline = if existing.ends_with('\n') { "" } else { "\n" };
    format!("{existing}{newline}{APPEND_SEPARATOR}{}", record.render())
}

/// Every block in the log, well-formed or not. A file with no `[FIX]` marker
/// is read as a single legacy block.
pub fn parse_blocks(text: &str) -> Vec<FixRecord> {
    if !text.contains(BLOCK_OPEN) {
        if text.trim().is_empty() {
            return Vec::new();
        }
        return vec![parse_block(text, false)];
    }
    text.split(BLOCK_OPEN)
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| parse_block(chunk, true))
        .collect()
}

/// Well-formed records only.
pub fn parse_records(text: &str) -> Vec<FixRecord> {
    parse_blocks(text)
        .into_iter()
        .filter(FixRecord::is_well_formed)
        .collect()
}

fn parse_block(chunk: &str, delimited: bool) -> FixRecord {
    let mut record = FixRecord::default();
    let mut in_files = false;
    for line in chunk.lines().map(str::trim) {
        if delimited && (line == BLOCK_CLOSE || line == "---") {
            break;
        }
        if let Some(value) = line.strip_prefix("Date:") {
            record.date = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("Game:") {
            record.game = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("Fix Type:") {
            record.fix_type = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("Download URL:") {
            record.download_url = value.trim().to_string();
        } else if line == "Files:" {
            in_files = true;
        } else if in_files && !line.is_empty() {
            record.files.push(line.to_string());
        }
    }
    record
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalPlan {
    /// Relative paths to delete, first occurrence order, no duplicates.
    pub files: Vec<String>,
    /// Blocks that stay in the log.
    pub retained: Vec<FixRecord>,
}

impl RemovalPlan {
    /// New log content, or `None` when the log should be deleted.
    pub fn rewritten_log(&self) -> Option<String> {
        if self.retained.is_empty() {
            return None;
        }
        let blocks = self
            .retained
            .iter()
            .map(|record| record.render().trim_end().to_string())
            .collect::<Vec<_>>();
        Some(format!("{}\n", blocks.join(REWRITE_SEPARATOR)))
    }
}

/// Selects blocks dated `fix_date` (every block when `None`) for removal.
/// Dated blocks that do not match are retained; undated ones are dropped.
pub fn plan_removal(text: &str, fix_date: Option<&str>) -> RemovalPlan {
    let mut plan = RemovalPlan::default();
    let mut seen = HashSet::new();
    for block in parse_blocks(text) {
        let selected = match fix_date {
            None => true,
            Some(date) => block.date == date,
        };
        if selected {
            for file in &block.files {
                if seen.insert(file.clone()) {
                    plan.files.push(file.clone());
                }
            }
        } else if block.is_well_formed() {
            plan.retained.push(block);
        }
    }
    plan
}
