//! TaskCoach task-file tooling.
//!
//! Two independent paths share the domain model in [`core`]:
//! - cleaning: raw lines → [`mutator`] → raw lines (period reset without a full re-serialize),
//! - reporting: parsed tree ([`tree`]) → per-day [`timeline`]s + [`summary`] table → [`output`].

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::{IndexMap, IndexSet};
    use serde::Serialize;
    use std::{collections::BTreeMap, fmt};

    /* ------------------------------ Markers ------------------------------ */

    pub const TASK_OPEN: &str = "<task ";
    pub const TASK_CLOSE: &str = "</task>";
    pub const EFFORT_OPEN: &str = "<effort ";
    pub const CATEGORY_OPEN: &str = "<category ";
    pub const SELF_CLOSING_END: &str = "/>";
    /// Literal substring that marks a completed task in the line buffer.
    pub const DONE_MARKER: &str = r#"percentageComplete="100""#;

    pub const TASK_TAG: &str = "task";
    pub const EFFORT_TAG: &str = "effort";
    pub const CATEGORY_TAG: &str = "category";
    pub const DESCRIPTION_TAG: &str = "description";

    pub const ATTR_ID: &str = "id";
    pub const ATTR_SUBJECT: &str = "subject";
    pub const ATTR_CATEGORIZABLES: &str = "categorizables";
    pub const ATTR_PERCENTAGE_COMPLETE: &str = "percentageComplete";
    pub const ATTR_COMPLETION_DATE: &str = "completiondate";
    pub const ATTR_ACTUAL_START_DATE: &str = "actualstartdate";
    pub const ATTR_START: &str = "start";
    pub const ATTR_STOP: &str = "stop";
    pub const DONE_VALUE: &str = "100";

    /// Task attributes that carry tracked-time bookkeeping and are reset per period.
    pub const LIFECYCLE_ATTRIBUTES: [&str; 3] = [
        ATTR_PERCENTAGE_COMPLETE,
        ATTR_COMPLETION_DATE,
        ATTR_ACTUAL_START_DATE,
    ];

    pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    const TIMESTAMP_FORMAT_FRACTIONAL: &str = "%Y-%m-%d %H:%M:%S%.f";

    pub const DEFAULT_RECURRING_CATEGORY: &str = "recurring";
    pub const DEFAULT_PATH_SEPARATOR: &str = "->";
    pub const MISSING_CATEGORY: &str = "<missing>";

    pub const DAY_BEGIN: NaiveTime = match NaiveTime::from_hms_opt(0, 0, 0) {
        Some(t) => t,
        None => panic!("00:00:00 is a valid time"),
    };
    /// The tracked day closes at 23:59:59, not at midnight of the next day.
    pub const DAY_END: NaiveTime = match NaiveTime::from_hms_opt(23, 59, 59) {
        Some(t) => t,
        None => panic!("23:59:59 is a valid time"),
    };

    pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, DocumentError> {
        let value = value.trim();
        NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT_FRACTIONAL))
            .map_err(|_| DocumentError::InvalidTimestamp {
                value: value.to_string(),
            })
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Progress {
        InProgress,
        Done,
    }

    impl Progress {
        pub fn from_percentage(value: Option<&str>) -> Self {
            if value == Some(DONE_VALUE) {
                Progress::Done
            } else {
                Progress::InProgress
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                Progress::InProgress => "wip",
                Progress::Done => "done",
            }
        }
    }

    /// A tracked interval, already clipped to the day it started on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
    pub struct Effort {
        pub start: NaiveDateTime,
        pub stop: NaiveDateTime,
    }

    impl Effort {
        pub fn day(&self) -> NaiveDate {
            self.start.date()
        }

        /// Whole minutes, floored. Inverted intervals yield negative values.
        pub fn minutes(&self) -> i64 {
            (self.stop - self.start).num_seconds().div_euclid(60)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Task {
        pub id: String,
        pub subject: String,
        pub progress: Progress,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub description: String,
        /// Efforts keyed by their start day, in document order.
        pub efforts: BTreeMap<NaiveDate, Vec<Effort>>,
        /// Summed minutes per start day.
        pub durations: BTreeMap<NaiveDate, i64>,
    }

    impl Task {
        pub fn new(id: impl Into<String>, subject: impl Into<String>, progress: Progress) -> Self {
            Self {
                id: id.into(),
                subject: subject.into(),
                progress,
                description: String::new(),
                efforts: BTreeMap::new(),
                durations: BTreeMap::new(),
            }
        }

        pub fn add_effort(&mut self, effort: Effort) {
            let day = effort.day();
            *self.durations.entry(day).or_insert(0) += effort.minutes();
            self.efforts.entry(day).or_default().push(effort);
        }

        pub fn has_efforts(&self) -> bool {
            !self.efforts.is_empty()
        }
    }

    pub type TaskMap = IndexMap<String, Task>;

    /// Category path → member task ids, both in document order.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    #[serde(transparent)]
    pub struct CategoryIndex {
        categories: IndexMap<String, IndexSet<String>>,
    }

    impl CategoryIndex {
        pub fn insert<I>(&mut self, path: impl Into<String>, task_ids: I)
        where
            I: IntoIterator<Item = String>,
        {
            self.categories
                .entry(path.into())
                .or_default()
                .extend(task_ids);
        }

        pub fn get(&self, path: &str) -> Option<&IndexSet<String>> {
            self.categories.get(path)
        }

        pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexSet<String>)> {
            self.categories.iter().map(|(k, v)| (k.as_str(), v))
        }

        /// All category paths a task belongs to, in category order.
        pub fn memberships(&self, task_id: &str) -> Vec<&str> {
            self.categories
                .iter()
                .filter(|(_, ids)| ids.contains(task_id))
                .map(|(path, _)| path.as_str())
                .collect()
        }

        pub fn contains_task(&self, task_id: &str) -> bool {
            self.categories.values().any(|ids| ids.contains(task_id))
        }

        pub fn len(&self) -> usize {
            self.categories.len()
        }

        pub fn is_empty(&self) -> bool {
            self.categories.is_empty()
        }
    }

    /* ------------------------------ Report cells ------------------------------ */

    /// One cell of a report table; text and minutes are kept apart so writers can
    /// emit numbers as numbers.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum Cell {
        Empty,
        Text(String),
        Minutes(i64),
    }

    impl fmt::Display for Cell {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Cell::Empty => Ok(()),
                Cell::Text(text) => f.write_str(text),
                Cell::Minutes(minutes) => write!(f, "{minutes}"),
            }
        }
    }

    /* ---------------------------- Errors (fatal) ---------------------------- */

    /// Conditions that abort a run before any output is written.
    #[derive(Debug, thiserror::Error)]
    pub enum DocumentError {
        #[error("line {line}: malformed tag: {reason}")]
        MalformedTag { line: usize, reason: String },
        #[error("line {line}: {message}")]
        Format { line: usize, message: String },
        #[error("line {line}: unbalanced task tag: {message}")]
        UnbalancedTag { line: usize, message: String },
        #[error(
            "effort of task '{task}' started at {start} has no stop time; stop the running timer first"
        )]
        RunningTimer { task: String, start: String },
        #[error("<{element}> element is missing required attribute '{attribute}'")]
        MissingAttribute {
            element: &'static str,
            attribute: &'static str,
        },
        #[error("invalid timestamp '{value}' (expected YYYY-MM-DD HH:MM:SS)")]
        InvalidTimestamp { value: String },
        #[error("no efforts found in the document; nothing to summarize")]
        NoEfforts,
        #[error("invalid XML: {0}")]
        Xml(#[from] roxmltree::Error),
    }

    /* -------------------------- Warnings (recoverable) -------------------------- */

    /// Data problems that are reported but do not stop processing.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub enum Warning {
        CrossMidnight {
            task: String,
            start: NaiveDateTime,
            stop: NaiveDateTime,
        },
        NegativeDuration {
            task: String,
            start: NaiveDateTime,
            stop: NaiveDateTime,
            minutes: i64,
        },
        MissingCategory {
            task_id: String,
            task: String,
        },
        TimeClash {
            day: NaiveDate,
            begin: NaiveTime,
            end: NaiveTime,
            minutes: i64,
            task: String,
        },
        InvertedInterval {
            day: NaiveDate,
            begin: NaiveTime,
            end: NaiveTime,
            task: String,
        },
    }

    impl fmt::Display for Warning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Warning::CrossMidnight { task, start, stop } => write!(
                    f,
                    "effort of '{task}' spans multiple days ({start} -> {stop}); only the part up to midnight of the first day is counted"
                ),
                Warning::NegativeDuration {
                    task,
                    start,
                    stop,
                    minutes,
                } => write!(
                    f,
                    "negative duration for task '{task}': {minutes} minutes ({start} -> {stop})"
                ),
                Warning::MissingCategory { task_id, task } => write!(
                    f,
                    "task '{task}' ({task_id}) has no category; assigned to '{MISSING_CATEGORY}'"
                ),
                Warning::TimeClash {
                    day,
                    begin,
                    end,
                    minutes,
                    task,
                } => write!(
                    f,
                    "on {day}, {minutes} minutes are tracked multiple times ({begin}-{end}) for task '{task}'"
                ),
                Warning::InvertedInterval {
                    day,
                    begin,
                    end,
                    task,
                } => write!(
                    f,
                    "on {day}, effort of '{task}' stops before it starts ({begin}-{end}); left out of the timeline"
                ),
            }
        }
    }

    /// Receives warnings from the engine; injected so callers decide where they go.
    pub trait WarningSink {
        fn warn(&mut self, warning: Warning);
    }

    impl WarningSink for Vec<Warning> {
        fn warn(&mut self, warning: Warning) {
            self.push(warning);
        }
    }

    /// Forwards every warning to `tracing` at WARN level.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TracingSink;

    impl WarningSink for TracingSink {
        fn warn(&mut self, warning: Warning) {
            tracing::warn!("{warning}");
        }
    }

}

pub mod codec {
    //! Attribute codec for single-line opening tags, e.g.
    //! `<task id="..." status="1" subject="Write report">`.
    //!
    //! Parsing keeps first-seen attribute order; serializing writes the remaining
    //! attributes back in that order.

    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till, take_while1},
        character::complete::{char, multispace0, multispace1},
        combinator::{all_consuming, map},
        multi::many0,
        sequence::{delimited, preceded, separated_pair, tuple},
    };
    use std::fmt::Write;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("{reason}")]
    pub struct MalformedTag {
        pub reason: String,
    }

    impl MalformedTag {
        fn near(rest: &str) -> Self {
            let snippet: String = rest.chars().take(40).collect();
            Self {
                reason: format!("expected name=\"value\" attributes or tag end at {snippet:?}"),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TagEnd {
        Open,
        SelfClosing,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OpeningTag {
        pub name: String,
        pub attributes: IndexMap<String, String>,
        pub end: TagEnd,
    }

    impl OpeningTag {
        pub fn get(&self, attribute: &str) -> Option<&str> {
            self.attributes.get(attribute).map(String::as_str)
        }

        pub fn remove(&mut self, attribute: &str) -> Option<String> {
            self.attributes.shift_remove(attribute)
        }

        pub fn is_self_closing(&self) -> bool {
            self.end == TagEnd::SelfClosing
        }

        /// Render back to `<name a="1" b="2">` / `<name a="1" b="2" />`.
        pub fn to_line(&self) -> String {
            let mut out = format!("<{}", self.name);
            for (name, value) in &self.attributes {
                let _ = write!(out, " {name}=\"{value}\"");
            }
            match self.end {
                TagEnd::Open => out.push('>'),
                TagEnd::SelfClosing => out.push_str(" />"),
            }
            out
        }
    }

    type PResult<'a, T> = IResult<&'a str, T>;

    /// Decode the attributes of an opening `name` tag occupying the whole fragment.
    pub fn parse_opening_tag(fragment: &str, name: &str) -> Result<OpeningTag, MalformedTag> {
        let parsed: PResult<'_, (Vec<(&str, &str)>, TagEnd)> = all_consuming(preceded(
            tuple((char('<'), tag(name))),
            tuple((many0(attribute), tag_end)),
        ))(fragment.trim());

        match parsed {
            Ok((_, (pairs, end))) => {
                let mut attributes = IndexMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    attributes.insert(key.to_string(), value.to_string());
                }
                Ok(OpeningTag {
                    name: name.to_string(),
                    attributes,
                    end,
                })
            }
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(MalformedTag::near(e.input)),
            Err(nom::Err::Incomplete(_)) => Err(MalformedTag {
                reason: "incomplete tag".to_string(),
            }),
        }
    }

    fn attribute(i: &str) -> PResult<'_, (&str, &str)> {
        preceded(
            multispace1,
            separated_pair(take_while1(is_name_char), char('='), quoted),
        )(i)
    }

    fn quoted(i: &str) -> PResult<'_, &str> {
        delimited(char('"'), take_till(|c| c == '"'), char('"'))(i)
    }

    fn tag_end(i: &str) -> PResult<'_, TagEnd> {
        preceded(
            multispace0,
            alt((
                map(tag("/>"), |_| TagEnd::SelfClosing),
                map(tag(">"), |_| TagEnd::Open),
            )),
        )(i)
    }

    fn is_name_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')
    }

}

pub mod mutator {
    //! Line-oriented edits of a task file.
    //!
    //! The buffer is indexed once into a flat arena of task records (opening line,
    //! matching closing line, parent). Deletions are marks on line indices applied in a
    //! single filtering pass; lines that are not edited are emitted unchanged.

    use crate::codec::{self, OpeningTag};
    use crate::core::*;
    use indexmap::IndexSet;

    /// Result of one pass: the rewritten buffer plus how many records it removed.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Edit {
        pub lines: Vec<String>,
        pub removed: usize,
    }

    /// A `<task>` element located in the buffer.
    #[derive(Debug, Clone)]
    struct TaskRecord {
        open: usize,
        close: usize,
        parent: Option<usize>,
        tag: OpeningTag,
    }

    impl TaskRecord {
        fn is_done(&self) -> bool {
            self.tag.get(ATTR_PERCENTAGE_COMPLETE) == Some(DONE_VALUE)
        }

        fn id(&self) -> Result<&str, DocumentError> {
            self.tag
                .get(ATTR_ID)
                .ok_or(DocumentError::MissingAttribute {
                    element: TASK_TAG,
                    attribute: ATTR_ID,
                })
        }
    }

    fn decode(line: &str, name: &str, idx: usize) -> Result<OpeningTag, DocumentError> {
        codec::parse_opening_tag(line, name).map_err(|e| DocumentError::MalformedTag {
            line: idx + 1,
            reason: e.reason,
        })
    }

    fn index_tasks(lines: &[String]) -> Result<Vec<TaskRecord>, DocumentError> {
        let mut records: Vec<TaskRecord> = Vec::new();
        let mut open_stack: Vec<usize> = Vec::new();

        for (idx, raw) in lines.iter().enumerate() {
            let line = raw.trim();
            if line.starts_with(TASK_OPEN) {
                let tag = decode(line, TASK_TAG, idx)?;
                let self_closing = tag.is_self_closing();
                records.push(TaskRecord {
                    open: idx,
                    close: idx,
                    parent: open_stack.last().copied(),
                    tag,
                });
                if !self_closing {
                    open_stack.push(records.len() - 1);
                }
            } else if line == TASK_CLOSE {
                let Some(rec) = open_stack.pop() else {
                    return Err(DocumentError::UnbalancedTag {
                        line: idx + 1,
                        message: format!("{TASK_CLOSE} without a matching opening tag"),
                    });
                };
                records[rec].close = idx;
            } else if line.contains(DONE_MARKER) {
                return Err(DocumentError::Format {
                    line: idx + 1,
                    message: format!(
                        "{DONE_MARKER} is expected in an opening task tag only: {line}"
                    ),
                });
            }
        }

        if let Some(&rec) = open_stack.last() {
            return Err(DocumentError::UnbalancedTag {
                line: records[rec].open + 1,
                message: "task is never closed before the end of the file".to_string(),
            });
        }
        Ok(records)
    }

    /// Drop the lifecycle attributes from a task line. Returns the line untouched
    /// (byte for byte) when none of them is present.
    fn strip_lifecycle(raw: &str, mut tag: OpeningTag) -> String {
        let removed = LIFECYCLE_ATTRIBUTES
            .iter()
            .filter(|attr| tag.remove(attr).is_some())
            .count();
        if removed == 0 {
            return raw.to_string();
        }
        let indent = &raw[..raw.len() - raw.trim_start().len()];
        format!("{indent}{}", tag.to_line())
    }

    /// Remove every completed task not listed in `recurring`, together with its whole
    /// subtree; completed recurring tasks stay but lose their lifecycle attributes.
    ///
    /// `removed` counts deleted subtrees; tasks inside an already deleted subtree are
    /// not counted again.
    pub fn remove_done_tasks(
        lines: Vec<String>,
        recurring: &IndexSet<String>,
    ) -> Result<Edit, DocumentError> {
        let records = index_tasks(&lines)?;
        let mut lines = lines;
        let mut deleted = vec![false; lines.len()];
        let mut dropped = vec![false; records.len()];
        let mut removed = 0;

        for (idx, record) in records.iter().enumerate() {
            if record.parent.is_some_and(|parent| dropped[parent]) {
                dropped[idx] = true;
                continue;
            }
            if !record.is_done() {
                continue;
            }
            let id = record.id()?;
            if recurring.contains(id) {
                tracing::debug!("keeping recurring task {id} (line {})", record.open + 1);
                lines[record.open] = strip_lifecycle(&lines[record.open], record.tag.clone());
                continue;
            }
            tracing::debug!(
                "removing done task {id} (lines {}-{})",
                record.open + 1,
                record.close + 1
            );
            deleted[record.open..=record.close].fill(true);
            dropped[idx] = true;
            removed += 1;
        }

        let lines = lines
            .into_iter()
            .zip(deleted)
            .filter_map(|(line, gone)| (!gone).then_some(line))
            .collect();
        Ok(Edit { lines, removed })
    }

    /// Remove every effort line and reset lifecycle attributes on every task line.
    pub fn remove_efforts(lines: Vec<String>) -> Result<Edit, DocumentError> {
        let mut out = Vec::with_capacity(lines.len());
        let mut removed = 0;

        for (idx, raw) in lines.into_iter().enumerate() {
            let line = raw.trim();
            if line.starts_with(EFFORT_OPEN) {
                if !line.ends_with(SELF_CLOSING_END) {
                    return Err(DocumentError::Format {
                        line: idx + 1,
                        message: format!("effort tags are expected to be empty elements: {line}"),
                    });
                }
                removed += 1;
            } else if line.starts_with(TASK_OPEN) {
                let tag = decode(line, TASK_TAG, idx)?;
                out.push(strip_lifecycle(&raw, tag));
            } else {
                out.push(raw);
            }
        }
        Ok(Edit {
            lines: out,
            removed,
        })
    }

    /// Member ids of every category line whose subject is `category`.
    pub fn recurring_task_ids(
        lines: &[String],
        category: &str,
    ) -> Result<IndexSet<String>, DocumentError> {
        let mut ids = IndexSet::new();
        for (idx, raw) in lines.iter().enumerate() {
            let line = raw.trim();
            if !line.starts_with(CATEGORY_OPEN) {
                continue;
            }
            let tag = decode(line, CATEGORY_TAG, idx)?;
            if tag.get(ATTR_SUBJECT) == Some(category) {
                if let Some(members) = tag.get(ATTR_CATEGORIZABLES) {
                    ids.extend(members.split_whitespace().map(str::to_string));
                }
            }
        }
        Ok(ids)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn lines(text: &str) -> Vec<String> {
            text.lines().map(str::to_string).collect()
        }

        fn no_recurring() -> IndexSet<String> {
            IndexSet::new()
        }

        const NESTED: &str = r#"<tasks>
<task id="a" percentageComplete="100" status="1" subject="Parent">
<task id="b" status="1" subject="Open child">
<effort id="e1" start="2020-05-01 09:00:00" status="1" stop="2020-05-01 10:00:00" />
</task>
<task id="c" status="1" subject="Leaf" />
</task>
<task id="d" status="1" subject="Keep" />
</tasks>"#;

        #[test]
        fn deleting_a_done_parent_removes_its_whole_subtree() {
            let edit = remove_done_tasks(lines(NESTED), &no_recurring()).unwrap();
            assert_eq!(edit.removed, 1);
            assert_eq!(
                edit.lines,
                lines("<tasks>\n<task id=\"d\" status=\"1\" subject=\"Keep\" />\n</tasks>")
            );
        }

        #[test]
        fn done_child_is_removed_without_touching_open_parent() {
            let text = r#"<tasks>
<task id="p" status="1" subject="Parent">
<task id="x" percentageComplete="100" subject="Done child">
<task id="y" subject="Grandchild" />
</task>
<task id="z" subject="Sibling" />
</task>
</tasks>"#;
            let edit = remove_done_tasks(lines(text), &no_recurring()).unwrap();
            assert_eq!(edit.removed, 1);
            assert_eq!(
                edit.lines,
                lines(
                    "<tasks>\n<task id=\"p\" status=\"1\" subject=\"Parent\">\n<task id=\"z\" subject=\"Sibling\" />\n</task>\n</tasks>"
                )
            );
        }

        #[test]
        fn nested_done_tasks_inside_a_removed_subtree_are_counted_once() {
            let text = r#"<task id="a" percentageComplete="100" subject="A">
<task id="b" percentageComplete="100" subject="B" />
</task>
<task id="c" percentageComplete="100" subject="C" />"#;
            let edit = remove_done_tasks(lines(text), &no_recurring()).unwrap();
            assert_eq!(edit.removed, 2);
            assert!(edit.lines.is_empty());
        }

        #[test]
        fn recurring_done_task_is_kept_without_lifecycle_attributes() {
            let text = r#"<tasks>
<task actualstartdate="2020-05-01 09:00:00" completiondate="2020-05-01 10:00:00" id="r" percentageComplete="100" status="1" subject="Standup">
<task id="r1" subject="Child" />
</task>
<task id="s" percentageComplete="100" completiondate="2020-05-02 10:00:00" subject="Weekly" />
</tasks>"#;
            let recurring: IndexSet<String> = ["r".to_string(), "s".to_string()].into();
            let edit = remove_done_tasks(lines(text), &recurring).unwrap();
            assert_eq!(edit.removed, 0);
            assert_eq!(
                edit.lines,
                lines(
                    "<tasks>\n<task id=\"r\" status=\"1\" subject=\"Standup\">\n<task id=\"r1\" subject=\"Child\" />\n</task>\n<task id=\"s\" subject=\"Weekly\" />\n</tasks>"
                )
            );
        }

        #[test]
        fn removing_done_tasks_is_idempotent() {
            let recurring: IndexSet<String> = ["d".to_string()].into();
            let first = remove_done_tasks(lines(NESTED), &recurring).unwrap();
            let second = remove_done_tasks(first.lines.clone(), &recurring).unwrap();
            assert_eq!(second.removed, 0);
            assert_eq!(second.lines, first.lines);
            assert!(!second.lines.iter().any(|l| l.contains(DONE_MARKER)));
        }

        #[test]
        fn untouched_lines_keep_their_indentation() {
            let text = "<tasks>\n  <task id=\"k\" subject=\"Keep\">\n    <description>\n    text\n    </description>\n  </task>\n</tasks>";
            let edit = remove_done_tasks(lines(text), &no_recurring()).unwrap();
            assert_eq!(edit.lines, lines(text));
        }

        #[test]
        fn completion_marker_outside_task_line_is_a_format_error() {
            let text = "<tasks>\n<note percentageComplete=\"100\" subject=\"n\" />\n</tasks>";
            let err = remove_done_tasks(lines(text), &no_recurring()).unwrap_err();
            assert!(matches!(err, DocumentError::Format { line: 2, .. }), "{err}");
        }

        #[test]
        fn unclosed_task_is_unbalanced() {
            let text = "<tasks>\n<task id=\"a\" percentageComplete=\"100\" subject=\"A\">\n</tasks>";
            let err = remove_done_tasks(lines(text), &no_recurring()).unwrap_err();
            assert!(matches!(err, DocumentError::UnbalancedTag { line: 2, .. }), "{err}");
        }

        #[test]
        fn stray_closing_tag_is_unbalanced() {
            let text = "<tasks>\n</task>\n</tasks>";
            let err = remove_done_tasks(lines(text), &no_recurring()).unwrap_err();
            assert!(matches!(err, DocumentError::UnbalancedTag { line: 2, .. }), "{err}");
        }

        #[test]
        fn malformed_task_line_aborts() {
            let text = "<task id=a percentageComplete=\"100\" />";
            let err = remove_done_tasks(lines(text), &no_recurring()).unwrap_err();
            assert!(matches!(err, DocumentError::MalformedTag { line: 1, .. }), "{err}");
        }

        #[test]
        fn remove_efforts_drops_effort_lines_and_resets_every_task() {
            let text = r#"<tasks>
<task actualstartdate="2020-05-01 09:00:00" id="a" status="1" subject="A">
<effort id="e1" start="2020-05-01 09:00:00" status="1" stop="2020-05-01 10:00:00" />
<effort id="e2" start="2020-05-01 11:00:00" status="1" stop="2020-05-01 12:00:00" />
</task>
<task id="b" percentageComplete="50" subject="B" />
</tasks>"#;
            let edit = remove_efforts(lines(text)).unwrap();
            assert_eq!(edit.removed, 2);
            assert_eq!(
                edit.lines,
                lines(
                    "<tasks>\n<task id=\"a\" status=\"1\" subject=\"A\">\n</task>\n<task id=\"b\" subject=\"B\" />\n</tasks>"
                )
            );
        }

        #[test]
        fn non_empty_effort_is_a_format_error() {
            let text = "<task id=\"a\" subject=\"A\">\n<effort id=\"e\" start=\"2020-05-01 09:00:00\">\n</effort>\n</task>";
            let err = remove_efforts(lines(text)).unwrap_err();
            assert!(matches!(err, DocumentError::Format { line: 2, .. }), "{err}");
        }

        #[test]
        fn recurring_ids_come_from_the_named_category() {
            let text = r#"<tasks>
<category categorizables="x1 x2" id="c1" subject="recurring" />
<category categorizables="w1" id="c2" subject="Work">
<category categorizables="w2" id="c3" subject="Admin" />
</category>
</tasks>"#;
            let ids = recurring_task_ids(&lines(text), "recurring").unwrap();
            assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["x1", "x2"]);
            assert!(recurring_task_ids(&lines(text), "Missing").unwrap().is_empty());
        }
    }
}

pub mod tree {
    //! Parsed view of a task file used for reporting.
    //!
    //! Two independent walks over the same XML tree: categories (path → member ids) and
    //! tasks (id → subject, progress, efforts). Nested tasks are separate entities.

    use crate::core::*;
    use chrono::NaiveDateTime;
    use roxmltree::{Document, Node};
    use serde::Serialize;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct DocumentTree {
        pub categories: CategoryIndex,
        pub tasks: TaskMap,
    }

    impl DocumentTree {
        pub fn has_efforts(&self) -> bool {
            self.tasks.values().any(Task::has_efforts)
        }
    }

    /// Parse a task file and extract categories and tasks.
    ///
    /// Category paths join ancestor subjects with `separator` (e.g. `Work->Admin`).
    pub fn parse_document(
        text: &str,
        separator: &str,
        sink: &mut dyn WarningSink,
    ) -> Result<DocumentTree, DocumentError> {
        let doc = Document::parse(text)?;
        let mut tree = DocumentTree::default();

        for node in doc.root_element().children().filter(Node::is_element) {
            match node.tag_name().name() {
                CATEGORY_TAG => walk_category(node, &[], separator, &mut tree.categories)?,
                TASK_TAG => walk_task(node, &mut tree.tasks, sink)?,
                _ => {}
            }
        }

        tracing::debug!("categories: {:#?}", tree.categories);
        tracing::debug!(
            "tasks: {} ({} with efforts)",
            tree.tasks.len(),
            tree.tasks.values().filter(|t| t.has_efforts()).count()
        );
        Ok(tree)
    }

    fn required(
        node: Node<'_, '_>,
        element: &'static str,
        attribute: &'static str,
    ) -> Result<String, DocumentError> {
        node.attribute(attribute)
            .map(str::to_string)
            .ok_or(DocumentError::MissingAttribute { element, attribute })
    }

    /* ------------------------------ Categories ------------------------------ */

    fn walk_category(
        node: Node<'_, '_>,
        ancestors: &[String],
        separator: &str,
        out: &mut CategoryIndex,
    ) -> Result<(), DocumentError> {
        let subject = required(node, CATEGORY_TAG, ATTR_SUBJECT)?;
        // Each level owns its path; siblings never see each other's names.
        let mut path = ancestors.to_vec();
        path.push(subject);

        let members = node
            .attribute(ATTR_CATEGORIZABLES)
            .map(|ids| ids.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        out.insert(path.join(separator), members);

        for child in node.children().filter(|n| n.has_tag_name(CATEGORY_TAG)) {
            walk_category(child, &path, separator, out)?;
        }
        Ok(())
    }

    /* -------------------------------- Tasks -------------------------------- */

    fn walk_task(
        node: Node<'_, '_>,
        tasks: &mut TaskMap,
        sink: &mut dyn WarningSink,
    ) -> Result<(), DocumentError> {
        let id = required(node, TASK_TAG, ATTR_ID)?;
        let subject = required(node, TASK_TAG, ATTR_SUBJECT)?;
        let progress = Progress::from_percentage(node.attribute(ATTR_PERCENTAGE_COMPLETE));
        let mut task = Task::new(id.clone(), subject, progress);

        let mut subtasks = Vec::new();
        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                TASK_TAG => subtasks.push(child),
                EFFORT_TAG => {
                    let effort = read_effort(child, &task.subject, sink)?;
                    task.add_effort(effort);
                }
                DESCRIPTION_TAG => {
                    task.description = child.text().unwrap_or_default().trim().to_string();
                }
                _ => {}
            }
        }
        tasks.insert(id, task);

        for child in subtasks {
            walk_task(child, tasks, sink)?;
        }
        Ok(())
    }

    fn read_effort(
        node: Node<'_, '_>,
        task: &str,
        sink: &mut dyn WarningSink,
    ) -> Result<Effort, DocumentError> {
        let start_raw = required(node, EFFORT_TAG, ATTR_START)?;
        let Some(stop_raw) = node.attribute(ATTR_STOP) else {
            return Err(DocumentError::RunningTimer {
                task: task.to_string(),
                start: start_raw,
            });
        };
        let start = parse_timestamp(&start_raw)?;
        let stop = parse_timestamp(stop_raw)?;
        Ok(clip_to_start_day(task, start, stop, sink))
    }

    /// Build an effort attributed to its start day. A stop on another day is cut to
    /// 23:59:59 of the start day and the remainder is dropped.
    pub fn clip_to_start_day(
        task: &str,
        start: NaiveDateTime,
        stop: NaiveDateTime,
        sink: &mut dyn WarningSink,
    ) -> Effort {
        let stop = if stop.date() != start.date() {
            sink.warn(Warning::CrossMidnight {
                task: task.to_string(),
                start,
                stop,
            });
            start.date().and_time(DAY_END)
        } else {
            stop
        };

        let effort = Effort { start, stop };
        let minutes = effort.minutes();
        if minutes < 0 {
            sink.warn(Warning::NegativeDuration {
                task: task.to_string(),
                start,
                stop,
                minutes,
            });
        }
        effort
    }

}

pub mod timeline {
    //! Per-day timeline reconstruction.
    //!
    //! Intervals may overlap or leave gaps; the resulting tracks never do. They are
    //! sorted, contiguous and cover `[00:00:00, 23:59:59]`.

    use crate::core::*;
    use chrono::{NaiveDate, NaiveTime, Timelike};
    use serde::Serialize;
    use std::collections::BTreeMap;

    pub const TRACK_HEADER: [&str; 6] = [
        "Day",
        "Begin",
        "End",
        "Duration (min)",
        "Warnings",
        "Task name",
    ];

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum TrackKind {
        Normal,
        Clash,
        Untracked,
    }

    impl TrackKind {
        pub fn label(self) -> &'static str {
            match self {
                TrackKind::Normal => "",
                TrackKind::Clash => "TIME-CLASH",
                TrackKind::Untracked => "<not tracked>",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Track {
        pub day: NaiveDate,
        pub begin: NaiveTime,
        pub end: NaiveTime,
        pub minutes: i64,
        pub kind: TrackKind,
        /// Empty for untracked time.
        pub task: String,
    }

    impl Track {
        fn new(day: NaiveDate, begin: NaiveTime, end: NaiveTime, kind: TrackKind, task: &str) -> Self {
            Self {
                day,
                begin,
                end,
                minutes: minutes_between(begin, end),
                kind,
                task: task.to_string(),
            }
        }

        fn with_span(&self, begin: NaiveTime, end: NaiveTime) -> Self {
            Track::new(self.day, begin, end, self.kind, &self.task)
        }

        pub fn cells(&self) -> Vec<Cell> {
            vec![
                Cell::Text(self.day.to_string()),
                Cell::Text(self.begin.format("%H:%M:%S").to_string()),
                Cell::Text(self.end.format("%H:%M:%S").to_string()),
                Cell::Minutes(self.minutes),
                Cell::Text(self.kind.label().to_string()),
                Cell::Text(self.task.clone()),
            ]
        }
    }

    /// One effort interval within a day.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Interval {
        pub start: NaiveTime,
        pub stop: NaiveTime,
        pub task: String,
    }

    /// Minutes between two times of the same day, counted as minute boundaries crossed.
    /// Adjacent spans therefore always add up to the span they cover.
    pub fn minutes_between(begin: NaiveTime, end: NaiveTime) -> i64 {
        minute_of_day(end) - minute_of_day(begin)
    }

    fn minute_of_day(t: NaiveTime) -> i64 {
        i64::from(t.num_seconds_from_midnight() / 60)
    }

    /// Tracks emitted so far; they partition `[DAY_BEGIN, cursor)`.
    struct DayTimeline {
        day: NaiveDate,
        tracks: Vec<Track>,
        cursor: NaiveTime,
    }

    impl DayTimeline {
        fn push(&mut self, begin: NaiveTime, end: NaiveTime, kind: TrackKind, task: &str) {
            if end > begin {
                self.tracks.push(Track::new(self.day, begin, end, kind, task));
            }
            if end > self.cursor {
                self.cursor = end;
            }
        }

        /// Relabel `[begin, end)` as a clash, splitting the tracks it cuts through.
        fn overlay_clash(&mut self, begin: NaiveTime, end: NaiveTime, task: &str) {
            let mut clash = Some(Track::new(self.day, begin, end, TrackKind::Clash, task));
            let mut out = Vec::with_capacity(self.tracks.len() + 2);
            for track in self.tracks.drain(..) {
                if track.end <= begin {
                    out.push(track);
                    continue;
                }
                if track.begin < begin {
                    out.push(track.with_span(track.begin, begin));
                }
                if let Some(clash) = clash.take() {
                    out.push(clash);
                }
                if track.end > end {
                    out.push(track.with_span(track.begin.max(end), track.end));
                }
            }
            out.extend(clash);
            self.tracks = out;
        }
    }

    /// Reconstruct the timeline of `day` from its intervals.
    pub fn build_day(
        day: NaiveDate,
        mut intervals: Vec<Interval>,
        sink: &mut dyn WarningSink,
    ) -> Vec<Track> {
        intervals.sort_by(|a, b| a.start.cmp(&b.start).then(a.stop.cmp(&b.stop)));

        let mut timeline = DayTimeline {
            day,
            tracks: Vec::with_capacity(intervals.len() * 2 + 1),
            cursor: DAY_BEGIN,
        };

        for interval in intervals {
            if interval.stop < interval.start {
                sink.warn(Warning::InvertedInterval {
                    day,
                    begin: interval.start,
                    end: interval.stop,
                    task: interval.task,
                });
                continue;
            }

            let mut begin = interval.start;
            if begin < timeline.cursor {
                let clash_end = interval.stop.min(timeline.cursor);
                let minutes = minutes_between(begin, clash_end);
                if minutes > 0 {
                    timeline.overlay_clash(begin, clash_end, &interval.task);
                    sink.warn(Warning::TimeClash {
                        day,
                        begin,
                        end: clash_end,
                        minutes,
                        task: interval.task.clone(),
                    });
                }
                begin = timeline.cursor;
            } else if begin > timeline.cursor {
                let gap_start = timeline.cursor;
                timeline.push(gap_start, begin, TrackKind::Untracked, "");
            }

            timeline.push(begin, interval.stop, TrackKind::Normal, &interval.task);
        }

        if timeline.cursor < DAY_END {
            let rest = timeline.cursor;
            timeline.push(rest, DAY_END, TrackKind::Untracked, "");
        }
        timeline.tracks
    }

    /// Timelines for every day that has at least one effort.
    pub fn build_timelines(
        tasks: &TaskMap,
        sink: &mut dyn WarningSink,
    ) -> BTreeMap<NaiveDate, Vec<Track>> {
        let mut per_day: BTreeMap<NaiveDate, Vec<Interval>> = BTreeMap::new();
        for task in tasks.values() {
            for (day, efforts) in &task.efforts {
                per_day.entry(*day).or_default().extend(efforts.iter().map(|e| Interval {
                    start: e.start.time(),
                    stop: e.stop.time(),
                    task: task.subject.clone(),
                }));
            }
        }

        let mut timelines = BTreeMap::new();
        for (day, intervals) in per_day {
            timelines.insert(day, build_day(day, intervals, sink));
        }
        timelines
    }

}

pub mod summary {
    //! Category × task report table with per-day durations and rollup rows.

    use crate::core::*;
    use crate::timeline::{Track, TrackKind};
    use crate::tree::DocumentTree;
    use chrono::{NaiveDate, NaiveTime};
    use serde::Serialize;
    use std::collections::{BTreeMap, BTreeSet};

    pub const LEADING_COLUMNS: [&str; 5] =
        ["Type", "Category", "Task name", "Progress", "Description"];
    pub const OVERALL_COLUMN: &str = "Period duration (min)";

    /// Knobs for the aggregation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SummaryOptions {
        /// Administrative category whose rows are not reported on their own.
        pub recurring_category: String,
        /// Category paths whose rows count as NO-WORK.
        pub no_work_categories: Vec<String>,
        pub drop_tasks_without_effort: bool,
        pub path_separator: String,
    }

    impl Default for SummaryOptions {
        fn default() -> Self {
            Self {
                recurring_category: DEFAULT_RECURRING_CATEGORY.to_string(),
                no_work_categories: vec!["Pause".to_string()],
                drop_tasks_without_effort: true,
                path_separator: DEFAULT_PATH_SEPARATOR.to_string(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum CategoryKind {
        Work,
        NoWork,
    }

    impl CategoryKind {
        pub fn label(self) -> &'static str {
            match self {
                CategoryKind::Work => "WORK",
                CategoryKind::NoWork => "NO-WORK",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SummaryRow {
        pub kind: CategoryKind,
        /// Every category the task belongs to, comma-joined.
        pub category: String,
        pub task_id: String,
        pub task: String,
        pub progress: Progress,
        pub description: String,
        /// One entry per report day, zero where the task has no effort.
        pub durations: BTreeMap<NaiveDate, i64>,
        pub overall: i64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct DayBounds {
        pub start: NaiveTime,
        pub stop: NaiveTime,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Totals {
        pub per_day: BTreeMap<NaiveDate, i64>,
        pub overall: i64,
    }

    impl Totals {
        fn zeroed(days: &[NaiveDate]) -> Self {
            Self {
                per_day: days.iter().map(|day| (*day, 0)).collect(),
                overall: 0,
            }
        }

        fn add(&mut self, row: &SummaryRow) {
            for (day, minutes) in &row.durations {
                *self.per_day.entry(*day).or_insert(0) += minutes;
            }
            self.overall += row.overall;
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Summary {
        pub days: Vec<NaiveDate>,
        pub rows: Vec<SummaryRow>,
        pub bounds: BTreeMap<NaiveDate, DayBounds>,
        pub untracked: BTreeMap<NaiveDate, i64>,
        pub all: Totals,
        pub work: Totals,
        pub no_work: Totals,
    }

    /// Copy of the category index where every task without a category sits in
    /// [`MISSING_CATEGORY`].
    pub fn with_missing_category(tree: &DocumentTree, sink: &mut dyn WarningSink) -> CategoryIndex {
        let mut categories = tree.categories.clone();
        for task in tree.tasks.values() {
            if !tree.categories.contains_task(&task.id) {
                sink.warn(Warning::MissingCategory {
                    task_id: task.id.clone(),
                    task: task.subject.clone(),
                });
                categories.insert(MISSING_CATEGORY, [task.id.clone()]);
            }
        }
        categories
    }

    pub fn build_summary(
        tree: &DocumentTree,
        timelines: &BTreeMap<NaiveDate, Vec<Track>>,
        options: &SummaryOptions,
        sink: &mut dyn WarningSink,
    ) -> Summary {
        let days: Vec<NaiveDate> = tree
            .tasks
            .values()
            .flat_map(|task| task.durations.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let categories = with_missing_category(tree, sink);

        let mut rows = Vec::new();
        for (path, task_ids) in categories.iter() {
            if path == options.recurring_category {
                continue;
            }
            let kind = if options.no_work_categories.iter().any(|c| c == path) {
                CategoryKind::NoWork
            } else {
                CategoryKind::Work
            };

            for task_id in task_ids {
                let Some(task) = tree.tasks.get(task_id) else {
                    tracing::debug!("category '{path}' lists unknown task id {task_id}");
                    continue;
                };
                if options.drop_tasks_without_effort && task.durations.is_empty() {
                    continue;
                }

                let durations: BTreeMap<NaiveDate, i64> = days
                    .iter()
                    .map(|day| (*day, task.durations.get(day).copied().unwrap_or(0)))
                    .collect();
                rows.push(SummaryRow {
                    kind,
                    category: categories.memberships(task_id).join(","),
                    task_id: task_id.clone(),
                    task: task.subject.clone(),
                    progress: task.progress,
                    description: task.description.clone(),
                    overall: durations.values().sum(),
                    durations,
                });
            }
        }

        let mut all = Totals::zeroed(&days);
        let mut work = Totals::zeroed(&days);
        let mut no_work = Totals::zeroed(&days);
        for row in &rows {
            all.add(row);
            match row.kind {
                CategoryKind::Work => work.add(row),
                CategoryKind::NoWork => no_work.add(row),
            }
        }

        Summary {
            bounds: day_bounds(tree),
            untracked: untracked_minutes(timelines),
            days,
            rows,
            all,
            work,
            no_work,
        }
    }

    /// Earliest start and latest stop per day across all tasks.
    fn day_bounds(tree: &DocumentTree) -> BTreeMap<NaiveDate, DayBounds> {
        let mut bounds: BTreeMap<NaiveDate, DayBounds> = BTreeMap::new();
        for (day, efforts) in tree.tasks.values().flat_map(|task| &task.efforts) {
            for effort in efforts {
                let (start, stop) = (effort.start.time(), effort.stop.time());
                bounds
                    .entry(*day)
                    .and_modify(|b| {
                        b.start = b.start.min(start);
                        b.stop = b.stop.max(stop);
                    })
                    .or_insert(DayBounds { start, stop });
            }
        }
        bounds
    }

    fn untracked_minutes(timelines: &BTreeMap<NaiveDate, Vec<Track>>) -> BTreeMap<NaiveDate, i64> {
        timelines
            .iter()
            .map(|(day, tracks)| {
                let minutes = tracks
                    .iter()
                    .filter(|t| t.kind == TrackKind::Untracked)
                    .map(|t| t.minutes)
                    .sum();
                (*day, minutes)
            })
            .collect()
    }

    fn hours(minutes: i64) -> Cell {
        Cell::Text(format!("{:.2}", minutes as f64 / 60.0))
    }

    impl Summary {
        pub fn header(&self) -> Vec<String> {
            LEADING_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .chain(self.days.iter().map(|d| d.to_string()))
                .chain(std::iter::once(OVERALL_COLUMN.to_string()))
                .collect()
        }

        /// Task rows followed by the trailing marker and sum rows.
        pub fn table(&self) -> Vec<Vec<Cell>> {
            let mut table = Vec::with_capacity(self.rows.len() + 9);
            for row in &self.rows {
                let mut cells = vec![
                    Cell::Text(row.kind.label().to_string()),
                    Cell::Text(row.category.clone()),
                    Cell::Text(row.task.clone()),
                    Cell::Text(row.progress.label().to_string()),
                    Cell::Text(row.description.clone()),
                ];
                cells.extend(row.durations.values().map(|m| Cell::Minutes(*m)));
                cells.push(Cell::Minutes(row.overall));
                table.push(cells);
            }

            let time = |t: NaiveTime| Cell::Text(t.format("%H:%M:%S").to_string());
            table.push(self.trailing(
                "Start (hh:mm:ss)",
                |day| self.bounds.get(&day).map_or(Cell::Empty, |b| time(b.start)),
                Cell::Empty,
            ));
            table.push(self.trailing(
                "Stop (hh:mm:ss)",
                |day| self.bounds.get(&day).map_or(Cell::Empty, |b| time(b.stop)),
                Cell::Empty,
            ));
            table.push(self.trailing(
                "Untracked (minutes)",
                |day| Cell::Minutes(self.untracked.get(&day).copied().unwrap_or(0)),
                Cell::Minutes(self.untracked.values().sum()),
            ));

            let sums = [("ALL", &self.all), ("WORK", &self.work), ("NO-WORK", &self.no_work)];
            for (label, totals) in sums {
                table.push(self.trailing(
                    &format!("SUMMED {label} (minutes)"),
                    |day| Cell::Minutes(totals.per_day.get(&day).copied().unwrap_or(0)),
                    Cell::Minutes(totals.overall),
                ));
            }
            for (label, totals) in sums {
                table.push(self.trailing(
                    &format!("SUMMED {label} (hours)"),
                    |day| hours(totals.per_day.get(&day).copied().unwrap_or(0)),
                    hours(totals.overall),
                ));
            }
            table
        }

        fn trailing(
            &self,
            label: &str,
            per_day: impl Fn(NaiveDate) -> Cell,
            overall: Cell,
        ) -> Vec<Cell> {
            let mut cells = vec![
                Cell::Empty,
                Cell::Empty,
                Cell::Text(label.to_string()),
                Cell::Empty,
                Cell::Empty,
            ];
            cells.extend(self.days.iter().map(|day| per_day(*day)));
            cells.push(overall);
            cells
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::timeline::build_timelines;
        use crate::tree::parse_document;

        const DOC: &str = r#"<?xml version="1.0" ?>
<tasks>
<category categorizables="t1 t2 ghost" id="c1" subject="A" />
<category categorizables="t1" id="c2" subject="B" />
<category categorizables="p" id="c3" subject="Pause" />
<category categorizables="t2" id="c4" subject="recurring" />
<task id="t1" subject="Shared" percentageComplete="100">
<effort id="e1" start="2020-05-01 09:00:00" stop="2020-05-01 10:00:00" />
</task>
<task id="t2" subject="Daily">
<effort id="e2" start="2020-05-02 08:00:00" stop="2020-05-02 08:15:00" />
</task>
<task id="p" subject="Lunch">
<effort id="e3" start="2020-05-01 12:00:00" stop="2020-05-01 12:30:00" />
</task>
<task id="loose" subject="No category">
<effort id="e4" start="2020-05-02 16:00:00" stop="2020-05-02 16:20:00" />
</task>
<task id="idle" subject="Never tracked" />
</tasks>"#;

        fn summarize(options: &SummaryOptions) -> (Summary, Vec<Warning>) {
            let mut warnings = Vec::new();
            let tree = parse_document(DOC, &options.path_separator, &mut warnings).unwrap();
            let timelines = build_timelines(&tree.tasks, &mut warnings);
            let summary = build_summary(&tree, &timelines, options, &mut warnings);
            (summary, warnings)
        }

        fn d(day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2020, 5, day).unwrap()
        }

        #[test]
        fn multi_category_task_gets_one_row_per_category() {
            let (summary, _) = summarize(&SummaryOptions::default());
            let shared: Vec<&SummaryRow> =
                summary.rows.iter().filter(|r| r.task_id == "t1").collect();
            assert_eq!(shared.len(), 2);
            assert!(shared.iter().all(|r| r.category == "A,B"));
            assert!(shared.iter().all(|r| r.progress == Progress::Done));
        }

        #[test]
        fn recurring_category_only_shows_up_in_category_field() {
            let (summary, _) = summarize(&SummaryOptions::default());
            let daily: Vec<&SummaryRow> =
                summary.rows.iter().filter(|r| r.task_id == "t2").collect();
            assert_eq!(daily.len(), 1);
            assert_eq!(daily[0].category, "A,recurring");
        }

        #[test]
        fn uncategorized_tasks_go_to_missing_bucket_with_warning() {
            let (summary, warnings) = summarize(&SummaryOptions::default());
            let loose = summary.rows.iter().find(|r| r.task_id == "loose").unwrap();
            assert_eq!(loose.category, MISSING_CATEGORY);
            assert_eq!(loose.kind, CategoryKind::Work);
            let missing: Vec<&str> = warnings
                .iter()
                .filter_map(|w| match w {
                    Warning::MissingCategory { task_id, .. } => Some(task_id.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(missing, vec!["loose", "idle"]);
        }

        #[test]
        fn idle_tasks_are_dropped_unless_requested() {
            let (summary, _) = summarize(&SummaryOptions::default());
            assert!(summary.rows.iter().all(|r| r.task_id != "idle"));

            let keep = SummaryOptions {
                drop_tasks_without_effort: false,
                ..SummaryOptions::default()
            };
            let (summary, _) = summarize(&keep);
            let idle = summary.rows.iter().find(|r| r.task_id == "idle").unwrap();
            assert_eq!(idle.overall, 0);
            assert_eq!(idle.durations.len(), 2);
        }

        #[test]
        fn totals_split_work_and_no_work() {
            let (summary, _) = summarize(&SummaryOptions::default());
            assert_eq!(summary.days, vec![d(1), d(2)]);
            // t1 is reported twice (A and B), so it counts twice.
            assert_eq!(summary.all.per_day[&d(1)], 60 + 60 + 30);
            assert_eq!(summary.all.per_day[&d(2)], 15 + 20);
            assert_eq!(summary.work.overall, 60 + 60 + 15 + 20);
            assert_eq!(summary.no_work.per_day[&d(1)], 30);
            assert_eq!(summary.no_work.per_day[&d(2)], 0);
        }

        #[test]
        fn day_bounds_and_untracked_minutes() {
            let (summary, _) = summarize(&SummaryOptions::default());
            let first = summary.bounds[&d(1)];
            assert_eq!(first.start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
            assert_eq!(first.stop, NaiveTime::from_hms_opt(12, 30, 0).unwrap());
            assert_eq!(summary.untracked[&d(1)], 1439 - 90);
            assert_eq!(summary.untracked[&d(2)], 1439 - 35);
        }

        #[test]
        fn table_has_trailing_rows_in_order() {
            let (summary, _) = summarize(&SummaryOptions::default());
            let header = summary.header();
            assert_eq!(header[2], "Task name");
            assert_eq!(header[5], "2020-05-01");
            assert_eq!(header.last().map(String::as_str), Some(OVERALL_COLUMN));

            let table = summary.table();
            assert!(table.iter().all(|row| row.len() == header.len()));
            let labels: Vec<String> = table[summary.rows.len()..]
                .iter()
                .map(|row| row[2].to_string())
                .collect();
            assert_eq!(
                labels,
                vec![
                    "Start (hh:mm:ss)",
                    "Stop (hh:mm:ss)",
                    "Untracked (minutes)",
                    "SUMMED ALL (minutes)",
                    "SUMMED WORK (minutes)",
                    "SUMMED NO-WORK (minutes)",
                    "SUMMED ALL (hours)",
                    "SUMMED WORK (hours)",
                    "SUMMED NO-WORK (hours)",
                ]
            );
            let all_hours = table.last().unwrap();
            assert_eq!(all_hours[5], Cell::Text("0.50".into()));
            let start = &table[summary.rows.len()];
            assert_eq!(start[5], Cell::Text("09:00:00".into()));
        }
    }
}

pub mod output {
    //! Output paths and report writers (CSV, XLSX).

    use crate::core::Cell;
    use anyhow::{Context, Result, bail};
    use rust_xlsxwriter::{Format, Workbook};
    use serde::Serialize;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub const TASK_FILE_EXTENSION: &str = "tsk";
    pub const SUMMARY_SHEET: &str = "SUMMARY";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ReportFormat {
        Csv,
        Xlsx,
    }

    impl ReportFormat {
        pub fn extension(self) -> &'static str {
            match self {
                ReportFormat::Csv => "csv",
                ReportFormat::Xlsx => "xlsx",
            }
        }
    }

    /// A named table: one sheet of a workbook, one block of a CSV file.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Sheet {
        pub name: String,
        pub header: Vec<String>,
        pub rows: Vec<Vec<Cell>>,
    }

    fn with_suffix(input: &Path, suffix: &str, extension: Option<&str>) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = format!("{stem}{suffix}");
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        input.with_file_name(name)
    }

    /// `<stem>_cleaned<ext>` next to the input.
    pub fn default_clean_output(input: &Path) -> PathBuf {
        let ext = input.extension().map(|e| e.to_string_lossy().into_owned());
        with_suffix(input, "_cleaned", ext.as_deref())
    }

    /// `<stem>_summary.<csv|xlsx>` next to the input.
    pub fn default_summary_output(input: &Path, format: ReportFormat) -> PathBuf {
        with_suffix(input, "_summary", Some(format.extension()))
    }

    pub fn require_extension(path: &Path, expected: &str) -> Result<()> {
        let matches = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(expected));
        if !matches {
            bail!("{:?} must have the .{expected} extension", path);
        }
        Ok(())
    }

    /// Reject an output that would overwrite the input.
    pub fn ensure_distinct(input: &Path, output: &Path) -> Result<()> {
        let same = if output.exists() {
            let a = fs::canonicalize(input).with_context(|| format!("resolving {:?}", input))?;
            let b = fs::canonicalize(output).with_context(|| format!("resolving {:?}", output))?;
            a == b
        } else {
            input == output
        };
        if same {
            bail!("refusing to overwrite input file {:?}", input);
        }
        Ok(())
    }

    pub fn prepare_parent_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
        }
        Ok(())
    }

    fn escape_csv(s: &str) -> String {
        if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
            format!("\"{}\"", s.replace('"', "\"\""))
        } else {
            s.to_string()
        }
    }

    /// Sheets one after another, separated by a blank line.
    pub fn render_csv(sheets: &[Sheet]) -> String {
        let mut out = String::new();
        for (idx, sheet) in sheets.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            let header: Vec<String> = sheet.header.iter().map(|h| escape_csv(h)).collect();
            out.push_str(&header.join(","));
            out.push('\n');
            for row in &sheet.rows {
                let cells: Vec<String> = row.iter().map(|c| escape_csv(&c.to_string())).collect();
                out.push_str(&cells.join(","));
                out.push('\n');
            }
        }
        out
    }

    pub fn write_csv(path: &Path, sheets: &[Sheet]) -> Result<()> {
        fs::write(path, render_csv(sheets)).with_context(|| format!("writing {:?}", path))
    }

    pub fn write_xlsx(path: &Path, sheets: &[Sheet]) -> Result<()> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();

        for sheet in sheets {
            let worksheet = workbook.add_worksheet();
            worksheet
                .set_name(&sheet.name)
                .with_context(|| format!("naming sheet {:?}", sheet.name))?;

            for (col, title) in sheet.header.iter().enumerate() {
                worksheet.write_string_with_format(0, column(col)?, title, &bold)?;
            }
            for (idx, row) in sheet.rows.iter().enumerate() {
                let r = u32::try_from(idx + 1).context("too many rows for a worksheet")?;
                for (col, cell) in row.iter().enumerate() {
                    match cell {
                        Cell::Empty => {}
                        Cell::Text(text) => {
                            worksheet.write_string(r, column(col)?, text)?;
                        }
                        Cell::Minutes(minutes) => {
                            worksheet.write_number(r, column(col)?, *minutes as f64)?;
                        }
                    }
                }
            }
        }

        workbook
            .save(path)
            .with_context(|| format!("writing {:?}", path))
    }

    fn column(idx: usize) -> Result<u16> {
        u16::try_from(idx).context("too many columns for a worksheet")
    }

    pub fn write_report(path: &Path, format: ReportFormat, sheets: &[Sheet]) -> Result<()> {
        match format {
            ReportFormat::Csv => write_csv(path, sheets),
            ReportFormat::Xlsx => write_xlsx(path, sheets),
        }
    }

}

pub mod clean {
    //! Period reset of a task file: drop finished work and all tracked time.

    use crate::core::*;
    use crate::mutator::{recurring_task_ids, remove_done_tasks, remove_efforts};
    use crate::output::{
        TASK_FILE_EXTENSION, default_clean_output, ensure_distinct, prepare_parent_dir,
        require_extension,
    };
    use anyhow::{Context, Result};
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::info;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CleanOptions {
        /// Category whose members survive even when completed.
        pub recurring_category: String,
    }

    impl Default for CleanOptions {
        fn default() -> Self {
            Self {
                recurring_category: DEFAULT_RECURRING_CATEGORY.to_string(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CleanOutcome {
        pub lines: Vec<String>,
        pub removed_tasks: usize,
        pub removed_efforts: usize,
    }

    /// Both passes over an in-memory buffer; nothing is returned unless both succeed.
    pub fn clean_lines(
        lines: Vec<String>,
        options: &CleanOptions,
    ) -> Result<CleanOutcome, DocumentError> {
        let recurring = recurring_task_ids(&lines, &options.recurring_category)?;
        tracing::debug!("recurring task ids: {:?}", recurring);

        let done = remove_done_tasks(lines, &recurring)?;
        let efforts = remove_efforts(done.lines)?;
        Ok(CleanOutcome {
            lines: efforts.lines,
            removed_tasks: done.removed,
            removed_efforts: efforts.removed,
        })
    }

    /// Clean `input` and write the result; returns the output path.
    pub fn clean_file(
        input: &Path,
        output: Option<&Path>,
        options: &CleanOptions,
    ) -> Result<(PathBuf, CleanOutcome)> {
        require_extension(input, TASK_FILE_EXTENSION)?;
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => default_clean_output(input),
        };
        require_extension(&output, TASK_FILE_EXTENSION)?;
        ensure_distinct(input, &output)?;

        let text = fs::read_to_string(input).with_context(|| format!("reading {:?}", input))?;
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        info!("read {} lines from {:?}", lines.len(), input);

        let outcome =
            clean_lines(lines, options).with_context(|| format!("cleaning {:?}", input))?;
        info!("removed {} done tasks", outcome.removed_tasks);
        info!("removed {} efforts", outcome.removed_efforts);

        let mut body = String::with_capacity(text.len());
        for line in &outcome.lines {
            body.push_str(line);
            body.push('\n');
        }
        prepare_parent_dir(&output)?;
        fs::write(&output, body).with_context(|| format!("writing {:?}", output))?;
        info!("wrote {:?}", output);
        Ok((output, outcome))
    }

}

pub mod report {
    //! Summary pipeline: task file → timelines + summary → CSV/XLSX (or JSON).

    use crate::core::*;
    use crate::output::{
        ReportFormat, SUMMARY_SHEET, Sheet, default_summary_output, ensure_distinct,
        prepare_parent_dir, require_extension, write_report,
    };
    use crate::summary::{Summary, SummaryOptions, build_summary};
    use crate::timeline::{TRACK_HEADER, Track, build_timelines};
    use crate::tree::parse_document;
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use serde::Serialize;
    use std::{
        collections::BTreeMap,
        fs,
        path::{Path, PathBuf},
    };
    use tracing::info;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Report {
        pub summary: Summary,
        pub timelines: BTreeMap<NaiveDate, Vec<Track>>,
    }

    impl Report {
        /// `SUMMARY` first, then one sheet per day in ascending order.
        pub fn sheets(&self) -> Vec<Sheet> {
            let mut sheets = vec![Sheet {
                name: SUMMARY_SHEET.to_string(),
                header: self.summary.header(),
                rows: self.summary.table(),
            }];
            for (day, tracks) in &self.timelines {
                sheets.push(Sheet {
                    name: day.to_string(),
                    header: TRACK_HEADER.iter().map(|h| h.to_string()).collect(),
                    rows: tracks.iter().map(Track::cells).collect(),
                });
            }
            sheets
        }
    }

    pub fn build_report(
        text: &str,
        options: &SummaryOptions,
        sink: &mut dyn WarningSink,
    ) -> Result<Report, DocumentError> {
        let tree = parse_document(text, &options.path_separator, sink)?;
        if !tree.has_efforts() {
            return Err(DocumentError::NoEfforts);
        }
        let timelines = build_timelines(&tree.tasks, sink);
        let summary = build_summary(&tree, &timelines, options, sink);
        Ok(Report { summary, timelines })
    }

    pub fn read_report(
        input: &Path,
        options: &SummaryOptions,
        sink: &mut dyn WarningSink,
    ) -> Result<Report> {
        let text = fs::read_to_string(input).with_context(|| format!("reading {:?}", input))?;
        build_report(&text, options, sink).with_context(|| format!("summarizing {:?}", input))
    }

    /// Summarize `input` into a report file; returns the output path.
    pub fn summarize_file(
        input: &Path,
        output: Option<&Path>,
        format: ReportFormat,
        options: &SummaryOptions,
        sink: &mut dyn WarningSink,
    ) -> Result<PathBuf> {
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => default_summary_output(input, format),
        };
        require_extension(&output, format.extension())?;
        ensure_distinct(input, &output)?;

        let report = read_report(input, options, sink)?;
        info!(
            "{} rows over {} days",
            report.summary.rows.len(),
            report.summary.days.len()
        );

        prepare_parent_dir(&output)?;
        info!("writing summary to {:?}", output);
        write_report(&output, format, &report.sheets())?;
        Ok(output)
    }

}
