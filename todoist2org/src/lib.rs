//! Todoist to Org mode projection library.
//! Modules keep the core pure: records come in as an immutable snapshot, headings
//! come out as a lazy sequence, and warnings leave through an explicit sink.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize};
    use serde_with::{BoolFromInt, DefaultOnNull, PickFirst, serde_as};
    use std::fmt;

    /* ------------------------------- IDs ------------------------------- */

    /// Opaque Todoist identifier. Sync v8 sends integers, v9 sends strings.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct RecordId(pub String);

    impl RecordId {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for RecordId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for RecordId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl<'de> Deserialize<'de> for RecordId {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Raw {
                Text(String),
                Number(i64),
            }

            Ok(match Raw::deserialize(deserializer)? {
                Raw::Text(s) => Self(s),
                Raw::Number(n) => Self(n.to_string()),
            })
        }
    }

    /* ------------------------------ Record set ------------------------------ */

    /// Read-only snapshot of the Sync API resources needed for one conversion.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RecordSet {
        #[serde(default)]
        pub projects: Vec<Project>,
        #[serde(default)]
        pub sections: Vec<Section>,
        #[serde(default)]
        pub items: Vec<Item>,
        #[serde(default)]
        pub labels: Vec<Label>,
        #[serde(default)]
        pub user: User,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct User {
        #[serde(default)]
        pub full_name: String,
        #[serde(default)]
        pub tz_info: TzInfo,
    }

    impl User {
        /// IANA timezone used for every timestamp without its own zone.
        pub fn timezone(&self) -> &str {
            &self.tz_info.timezone
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TzInfo {
        #[serde(default = "default_timezone")]
        pub timezone: String,
    }

    fn default_timezone() -> String {
        "UTC".to_string()
    }

    impl Default for TzInfo {
        fn default() -> Self {
            Self {
                timezone: default_timezone(),
            }
        }
    }

    /* ------------------------------ Records ------------------------------ */

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Project {
        pub id: RecordId,
        pub name: String,
        #[serde(default)]
        pub parent_id: Option<RecordId>,
        /// Sync v8 sends `0`/`1`.
        #[serde(default)]
        #[serde_as(as = "PickFirst<(_, BoolFromInt)>")]
        pub is_archived: bool,
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub id: RecordId,
        pub project_id: RecordId,
        pub name: String,
        #[serde(default)]
        pub section_order: i64,
        #[serde(default, alias = "date_added")]
        pub added_at: Option<String>,
        #[serde(default)]
        #[serde_as(as = "PickFirst<(_, BoolFromInt)>")]
        pub is_archived: bool,
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Item {
        pub id: RecordId,
        pub project_id: RecordId,
        #[serde(default)]
        pub section_id: Option<RecordId>,
        #[serde(default)]
        pub parent_id: Option<RecordId>,
        #[serde(default, alias = "item_order")]
        pub child_order: i64,
        pub content: String,
        #[serde(default)]
        #[serde_as(as = "DefaultOnNull")]
        pub description: String,
        /// 1 (normal) ..= 4 (urgent); validated when the heading is built.
        #[serde(default = "Item::default_priority")]
        pub priority: u8,
        #[serde(default, alias = "date_added")]
        pub added_at: Option<String>,
        #[serde(default, alias = "date_completed")]
        pub completed_at: Option<String>,
        #[serde(default)]
        pub due: Option<Due>,
        #[serde(default)]
        pub deadline: Option<Deadline>,
        /// Label references in the order Todoist stores them.
        #[serde(default)]
        #[serde_as(as = "DefaultOnNull")]
        pub labels: Vec<RecordId>,
    }

    impl Item {
        fn default_priority() -> u8 {
            1
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Due {
        pub date: String,
        #[serde(default)]
        pub timezone: Option<String>,
        #[serde(default)]
        pub is_recurring: bool,
        /// Human-entered due string, e.g. "every friday".
        #[serde(default)]
        pub string: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Deadline {
        pub date: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Label {
        pub id: RecordId,
        pub name: String,
        #[serde(default, alias = "order")]
        pub item_order: i64,
    }

    /* ------------------------------ Headings ------------------------------ */

    /// One Org heading block, flattened (children are separate headings).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Heading {
        /// Number of stars; always >= 1.
        pub level: usize,
        pub state: Option<TodoState>,
        pub priority: Priority,
        pub content: String,
        #[serde(default)]
        pub tags: Vec<Tag>,
        #[serde(default)]
        pub planning: Planning,
        /// Property drawer entries in insertion order.
        #[serde(default)]
        pub properties: IndexMap<String, String>,
        #[serde(default)]
        pub description: String,
    }

    impl Heading {
        pub fn new(level: usize, content: impl Into<String>) -> Self {
            Self {
                level,
                state: None,
                priority: Priority::Normal,
                content: content.into(),
                tags: vec![],
                planning: Planning::default(),
                properties: IndexMap::new(),
                description: String::new(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TodoState {
        Todo,
        Done,
    }

    impl TodoState {
        pub fn keyword(self) -> &'static str {
            match self {
                TodoState::Todo => "TODO",
                TodoState::Done => "DONE",
            }
        }
    }

    /// Todoist priority mapped onto Org cookies: 4 -> `[#A]`, 3 -> `[#B]`, 2 -> `[#C]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Priority {
        Normal,
        Medium,
        High,
        Urgent,
    }

    impl Priority {
        pub fn cookie(self) -> Option<char> {
            match self {
                Priority::Normal => None,
                Priority::Medium => Some('C'),
                Priority::High => Some('B'),
                Priority::Urgent => Some('A'),
            }
        }
    }

    impl TryFrom<u8> for Priority {
        type Error = OutlineError;

        fn try_from(value: u8) -> Result<Self, Self::Error> {
            match value {
                1 => Ok(Priority::Normal),
                2 => Ok(Priority::Medium),
                3 => Ok(Priority::High),
                4 => Ok(Priority::Urgent),
                other => Err(OutlineError::InvalidPriority(other)),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /// Planning line entries, already rendered as Org timestamps.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Planning {
        pub closed: Option<String>,
        pub scheduled: Option<String>,
        pub deadline: Option<String>,
    }

    impl Planning {
        pub fn is_empty(&self) -> bool {
            self.closed.is_none() && self.scheduled.is_none() && self.deadline.is_none()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TimestampError {
        #[error("malformed timestamp {0:?}")]
        Malformed(String),
        #[error("unknown timezone {0:?}")]
        UnknownTimezone(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum OutlineError {
        #[error("unresolved {kind} reference {id}")]
        UnresolvedReference { kind: &'static str, id: RecordId },
        #[error("project {0} has a missing or cyclic ancestor")]
        CycleOrMissingAncestor(RecordId),
        #[error(transparent)]
        Timestamp(#[from] TimestampError),
        #[error("priority {0} is out of range (1..=4)")]
        InvalidPriority(u8),
    }

}

pub mod diagnostics {
    //! Seam for warnings the caller should see, kept apart from the headings.

    /// Receives user-facing warnings raised during a projection.
    pub trait WarningSink {
        fn warn(&self, message: &str);
    }

    /// Default sink: forwards to the `log` facade at warn level.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LogWarnings;

    impl WarningSink for LogWarnings {
        fn warn(&self, message: &str) {
            log::warn!("{message}");
        }
    }
}

pub mod timestamp {
    //! Todoist date strings to Org timestamps.
    //!
    //! Accepted inputs:
    //! - full-day dates (`2024-05-05`), rendered as-is with no zone shift;
    //! - RFC 3339 date-times with `Z` or an offset, converted to the target zone;
    //! - floating date-times without offset, treated as wall-clock in the target zone;
    //! - the legacy Sync v7 form `Fri 26 Sep 2014 08:25:05 +0000`.

    use crate::core::TimestampError;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
    use chrono_tz::Tz;

    const DATE_FORMAT: &str = "%Y-%m-%d %a";
    const DATE_TIME_FORMAT: &str = "%Y-%m-%d %a %H:%M";
    const FLOATING_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];
    const LEGACY_FORMAT: &str = "%a %d %b %Y %H:%M:%S %z";

    enum Parsed {
        Date(NaiveDate),
        Floating(NaiveDateTime),
        Absolute(DateTime<FixedOffset>),
    }

    /// Format `raw` as an Org timestamp in `timezone`; `<...>` when `active`, `[...]` otherwise.
    pub fn format_timestamp(
        raw: &str,
        timezone: &str,
        active: bool,
    ) -> Result<String, TimestampError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| TimestampError::UnknownTimezone(timezone.to_string()))?;

        let body = match parse(raw.trim())? {
            Parsed::Date(date) => date.format(DATE_FORMAT).to_string(),
            Parsed::Floating(local) => local.format(DATE_TIME_FORMAT).to_string(),
            Parsed::Absolute(instant) => instant
                .with_timezone(&tz)
                .format(DATE_TIME_FORMAT)
                .to_string(),
        };

        Ok(if active {
            format!("<{body}>")
        } else {
            format!("[{body}]")
        })
    }

    fn parse(raw: &str) -> Result<Parsed, TimestampError> {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(Parsed::Date(date));
        }
        if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Parsed::Absolute(instant));
        }
        for fmt in FLOATING_FORMATS {
            if let Ok(local) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Ok(Parsed::Floating(local));
            }
        }
        DateTime::parse_from_str(raw, LEGACY_FORMAT)
            .map(Parsed::Absolute)
            .map_err(|_| TimestampError::Malformed(raw.to_string()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn full_day_dates_are_not_shifted() {
            assert_eq!(
                format_timestamp("2024-05-05", "Pacific/Auckland", true).unwrap(),
                "<2024-05-05 Sun>"
            );
            assert_eq!(
                format_timestamp("2024-05-05", "America/Los_Angeles", false).unwrap(),
                "[2024-05-05 Sun]"
            );
        }

        #[test]
        fn utc_instants_convert_to_target_zone() {
            assert_eq!(
                format_timestamp("2024-05-05T18:30:00Z", "America/New_York", true).unwrap(),
                "<2024-05-05 Sun 14:30>"
            );
            // Crossing midnight moves the calendar date too.
            assert_eq!(
                format_timestamp("2024-05-06T02:00:00.000000Z", "America/New_York", false)
                    .unwrap(),
                "[2024-05-05 Sun 22:00]"
            );
        }

        #[test]
        fn floating_times_keep_wall_clock() {
            assert_eq!(
                format_timestamp("2024-05-05T09:15:00", "Asia/Tokyo", true).unwrap(),
                "<2024-05-05 Sun 09:15>"
            );
            assert_eq!(
                format_timestamp("2024-05-05T09:15", "UTC", true).unwrap(),
                "<2024-05-05 Sun 09:15>"
            );
        }

        #[test]
        fn legacy_sync_format_is_accepted() {
            assert_eq!(
                format_timestamp("Fri 26 Sep 2014 08:25:05 +0000", "UTC", false).unwrap(),
                "[2014-09-26 Fri 08:25]"
            );
        }

        #[test]
        fn bad_input_is_reported() {
            assert_eq!(
                format_timestamp("2024-05-05", "Mars/Olympus_Mons", true),
                Err(TimestampError::UnknownTimezone("Mars/Olympus_Mons".into()))
            );
            assert_eq!(
                format_timestamp("next tuesday", "UTC", true),
                Err(TimestampError::Malformed("next tuesday".into()))
            );
        }
    }
}

pub mod markup {
    //! Markdown hyperlinks to Org links, built on `nom`.

    use nom::{
        IResult,
        bytes::complete::{is_not, tag},
        character::complete::char,
        combinator::{opt, recognize},
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Rewrite every `[label](url)` into `[[url][label]]`, leftmost first.
    ///
    /// Existing Org links are copied through untouched, so running the
    /// conversion twice gives the same text as running it once.
    pub fn convert_links(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find('[') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos..];

            if let Ok((r, raw)) = org_link(rest) {
                out.push_str(raw);
                rest = r;
            } else if let Ok((r, (label, url))) = markdown_link(rest) {
                out.push_str("[[");
                out.push_str(url);
                out.push_str("][");
                out.push_str(label);
                out.push_str("]]");
                rest = r;
            } else {
                out.push('[');
                rest = &rest[1..];
            }
        }
        out.push_str(rest);
        out
    }

    /// `[[target]]` or `[[target][label]]`, neither part holding brackets.
    fn org_link(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            tag("[["),
            is_not("[]"),
            opt(tuple((tag("]["), is_not("[]")))),
            tag("]]"),
        )))(i)
    }

    fn markdown_link(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, (_, label, _, url, _)) =
            tuple((char('['), is_not("[]"), tag("]("), is_not("()"), char(')')))(i)?;
        Ok((i, (label, url)))
    }

}

pub mod format {
    //! Rendering of heading blocks and the file header.

    use super::core::*;
    use chrono::NaiveDateTime;

    /// Lines of a single heading block, without trailing newlines.
    pub fn render_heading(heading: &Heading) -> Vec<String> {
        let indent = " ".repeat(heading.level);
        let mut lines = vec![render_headline(heading)];

        if !heading.planning.is_empty() {
            lines.push(format!("{indent} {}", render_planning(&heading.planning)));
        }

        if !heading.properties.is_empty() {
            lines.push(format!("{indent} :PROPERTIES:"));
            for (name, value) in &heading.properties {
                lines.push(format!("{indent} :{name}: {value}"));
            }
            lines.push(format!("{indent} :END:"));
        }

        for line in heading.description.lines() {
            if line.is_empty() {
                lines.push(String::new());
            } else {
                lines.push(format!("{indent} {line}"));
            }
        }

        lines
    }

    /// The heading block as text, newline-terminated.
    pub fn render_block(heading: &Heading) -> String {
        let mut buf = render_heading(heading).join("\n");
        buf.push('\n');
        buf
    }

    /// `#+AUTHOR:`, `#+DATE:` and `#+TITLE:` lines for the top of a file.
    pub fn file_header(author: &str, title: &str, generated: NaiveDateTime) -> Vec<String> {
        vec![
            format!("#+AUTHOR: {author}"),
            format!("#+DATE: {}", generated.format("[%Y-%m-%d %a %H:%M]")),
            format!("#+TITLE: {title}"),
        ]
    }

    fn render_headline(heading: &Heading) -> String {
        let mut buf = "*".repeat(heading.level);
        buf.push(' ');

        if let Some(state) = heading.state {
            buf.push_str(state.keyword());
            buf.push(' ');
        }

        if let Some(cookie) = heading.priority.cookie() {
            buf.push_str(&format!("[#{cookie}] "));
        }

        buf.push_str(&heading.content);

        if !heading.tags.is_empty() {
            buf.push_str(" :");
            for tag in &heading.tags {
                buf.push_str(&tag.0);
                buf.push(':');
            }
        }
        buf
    }

    fn render_planning(plan: &Planning) -> String {
        let mut parts = Vec::new();
        if let Some(ts) = &plan.closed {
            parts.push(format!("CLOSED: {ts}"));
        }
        if let Some(ts) = &plan.scheduled {
            parts.push(format!("SCHEDULED: {ts}"));
        }
        if let Some(ts) = &plan.deadline {
            parts.push(format!("DEADLINE: {ts}"));
        }
        parts.join(" ")
    }

}

pub mod projectors {
    pub mod recurrence {
        //! Recurring due dates are not expanded; the user converts them by hand.

        use crate::core::{Due, Item};
        use crate::diagnostics::WarningSink;

        pub const RECURRING_TAG: &str = "IS_RECURRING";

        pub const AGGREGATE_WARNING: &str = "Automatic conversion of recurring due dates is NOT supported. \
Items with recurring due dates are tagged with :IS_RECURRING: for manual conversion. \
See the Org manual 'Repeated tasks' section: https://orgmode.org/manual/Repeated-tasks.html";

        /// Emit one aggregate warning if any item has a recurring due date.
        /// Returns whether the warning was emitted.
        pub fn warn_if_any_recurring<'a>(
            items: impl IntoIterator<Item = &'a Item>,
            sink: &dyn WarningSink,
        ) -> bool {
            let any_recurring = items
                .into_iter()
                .any(|item| item.due.as_ref().is_some_and(|due| due.is_recurring));
            if any_recurring {
                sink.warn(AGGREGATE_WARNING);
            }
            any_recurring
        }

        pub(crate) fn warn_item(item: &Item, due: &Due, sink: &dyn WarningSink) {
            sink.warn(&format!(
                "item with content {:?} has recurring due date {:?}",
                item.content, due.string
            ));
        }

    }

    pub mod outline_projector {
        //! Flat Todoist records to a depth-first sequence of Org headings.
        //!
        //! Records stay in the caller's `RecordSet`; `OutlineIndex` only holds
        //! references keyed by id. Traversal uses an explicit stack, so deep
        //! sub-task chains cannot exhaust the call stack.

        use super::recurrence::{self, RECURRING_TAG};
        use crate::core::*;
        use crate::diagnostics::{LogWarnings, WarningSink};
        use crate::format::render_block;
        use crate::markup::convert_links;
        use crate::timestamp::format_timestamp;
        use indexmap::IndexMap;
        use std::collections::HashMap;

        pub const ARCHIVED_TAG: &str = "ARCHIVED";

        #[derive(Debug, Clone, Copy, Default)]
        pub struct OutlineOptions {
            /// Include archived projects and sections (tagged `ARCHIVED`).
            pub include_archived: bool,
        }

        /* ------------------------------ Index ------------------------------ */

        /// Id lookups and per-owner groupings over one record set.
        pub struct OutlineIndex<'a> {
            records: &'a RecordSet,
            projects: IndexMap<&'a RecordId, &'a Project>,
            /// Sections per project, sorted by `section_order`.
            sections: HashMap<&'a RecordId, Vec<&'a Section>>,
            /// Items per project, sorted by `child_order`.
            items: HashMap<&'a RecordId, Vec<&'a Item>>,
            items_by_id: HashMap<&'a RecordId, &'a Item>,
            /// Sub-items per parent item, sorted by `child_order`.
            children: HashMap<&'a RecordId, Vec<&'a Item>>,
            labels: HashMap<&'a RecordId, &'a Label>,
            labels_by_name: HashMap<&'a str, &'a Label>,
        }

        impl<'a> OutlineIndex<'a> {
            pub fn new(records: &'a RecordSet) -> Self {
                let projects: IndexMap<_, _> =
                    records.projects.iter().map(|p| (&p.id, p)).collect();

                let mut sections: HashMap<&RecordId, Vec<&Section>> = HashMap::new();
                for section in &records.sections {
                    if projects.contains_key(&section.project_id) {
                        sections.entry(&section.project_id).or_default().push(section);
                    } else {
                        log::debug!(
                            "skipping section {} of unknown project {}",
                            section.id,
                            section.project_id
                        );
                    }
                }
                for list in sections.values_mut() {
                    list.sort_by_key(|s| s.section_order);
                }

                let mut items: HashMap<&RecordId, Vec<&Item>> = HashMap::new();
                let mut items_by_id = HashMap::new();
                let mut children: HashMap<&RecordId, Vec<&Item>> = HashMap::new();
                for item in &records.items {
                    if !projects.contains_key(&item.project_id) {
                        log::debug!(
                            "skipping item {} of unknown project {}",
                            item.id,
                            item.project_id
                        );
                        continue;
                    }
                    items.entry(&item.project_id).or_default().push(item);
                    items_by_id.insert(&item.id, item);
                    if let Some(parent_id) = &item.parent_id {
                        children.entry(parent_id).or_default().push(item);
                    }
                }
                for list in items.values_mut().chain(children.values_mut()) {
                    list.sort_by_key(|i| i.child_order);
                }

                Self {
                    records,
                    projects,
                    sections,
                    items,
                    items_by_id,
                    children,
                    labels: records.labels.iter().map(|l| (&l.id, l)).collect(),
                    labels_by_name: records
                        .labels
                        .iter()
                        .map(|l| (l.name.as_str(), l))
                        .collect(),
                }
            }

            pub fn project(&self, id: &RecordId) -> Result<&'a Project, OutlineError> {
                self.projects
                    .get(id)
                    .copied()
                    .ok_or_else(|| OutlineError::UnresolvedReference {
                        kind: "project",
                        id: id.clone(),
                    })
            }

            /// 1 for a root project, 1 + ancestor count otherwise.
            pub fn project_depth(&self, id: &RecordId) -> Result<usize, OutlineError> {
                let mut current = self
                    .projects
                    .get(id)
                    .copied()
                    .ok_or_else(|| OutlineError::CycleOrMissingAncestor(id.clone()))?;
                let mut depth = 1;
                while let Some(parent_id) = &current.parent_id {
                    // A chain longer than the project count must revisit a project.
                    if depth >= self.projects.len() {
                        return Err(OutlineError::CycleOrMissingAncestor(parent_id.clone()));
                    }
                    current = self
                        .projects
                        .get(parent_id)
                        .copied()
                        .ok_or_else(|| OutlineError::CycleOrMissingAncestor(parent_id.clone()))?;
                    depth += 1;
                }
                Ok(depth)
            }

            fn sections_of(&self, project_id: &RecordId) -> &[&'a Section] {
                self.sections
                    .get(project_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
            }

            fn items_of(&self, project_id: &RecordId) -> &[&'a Item] {
                self.items
                    .get(project_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
            }

            fn children_of(&self, item: &'a Item) -> impl Iterator<Item = &'a Item> + '_ {
                let project_id = &item.project_id;
                self.children
                    .get(&item.id)
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(move |child| &child.project_id == project_id)
            }

            /// Every item of the project must point at a known section and parent.
            fn check_project_items(&self, project_id: &RecordId) -> Result<(), OutlineError> {
                let sections = self.sections_of(project_id);
                for item in self.items_of(project_id) {
                    if let Some(section_id) = &item.section_id {
                        if !sections.iter().any(|s| &s.id == section_id) {
                            return Err(OutlineError::UnresolvedReference {
                                kind: "section",
                                id: section_id.clone(),
                            });
                        }
                    }
                    if let Some(parent_id) = &item.parent_id {
                        match self.items_by_id.get(parent_id) {
                            Some(parent) if parent.project_id == *project_id => {}
                            _ => {
                                return Err(OutlineError::UnresolvedReference {
                                    kind: "parent item",
                                    id: parent_id.clone(),
                                });
                            }
                        }
                    }
                }
                Ok(())
            }

            fn label(&self, reference: &RecordId) -> Result<&'a Label, OutlineError> {
                self.labels
                    .get(reference)
                    .or_else(|| self.labels_by_name.get(reference.as_str()))
                    .copied()
                    .ok_or_else(|| OutlineError::UnresolvedReference {
                        kind: "label",
                        id: reference.clone(),
                    })
            }

            /* -------------------------- Heading builders -------------------------- */

            fn project_heading(&self, project: &Project, level: usize) -> Heading {
                let mut heading = Heading::new(level, project.name.clone());
                if project.is_archived {
                    heading.tags.push(Tag::from(ARCHIVED_TAG));
                }
                heading
                    .properties
                    .insert("CATEGORY".into(), project.name.clone());
                heading
            }

            fn section_heading(
                &self,
                section: &Section,
                level: usize,
            ) -> Result<Heading, OutlineError> {
                let mut heading = Heading::new(level, section.name.clone());
                if section.is_archived {
                    heading.tags.push(Tag::from(ARCHIVED_TAG));
                }
                if let Some(added) = &section.added_at {
                    let created = format_timestamp(added, self.records.user.timezone(), false)?;
                    heading.properties.insert("CREATED".into(), created);
                }
                Ok(heading)
            }

            fn item_heading(
                &self,
                item: &Item,
                level: usize,
                sink: &dyn WarningSink,
            ) -> Result<Heading, OutlineError> {
                let user_tz = self.records.user.timezone();

                let mut heading = Heading::new(level, convert_links(&item.content));
                heading.priority = Priority::try_from(item.priority)?;
                heading.state = Some(if item.completed_at.is_some() {
                    TodoState::Done
                } else {
                    TodoState::Todo
                });

                let mut labels = item
                    .labels
                    .iter()
                    .map(|reference| self.label(reference))
                    .collect::<Result<Vec<_>, _>>()?;
                labels.sort_by_key(|label| label.item_order);
                heading.tags = labels
                    .into_iter()
                    .map(|label| Tag(label.name.clone()))
                    .collect();

                if let Some(completed) = &item.completed_at {
                    heading.planning.closed = Some(format_timestamp(completed, user_tz, false)?);
                }

                if let Some(due) = &item.due {
                    let due_tz = due
                        .timezone
                        .as_deref()
                        .filter(|tz| !tz.is_empty())
                        .unwrap_or(user_tz);
                    if due.is_recurring {
                        heading.tags.push(Tag::from(RECURRING_TAG));
                        recurrence::warn_item(item, due, sink);
                    }
                    heading.planning.scheduled = Some(format_timestamp(&due.date, due_tz, true)?);
                }

                if let Some(deadline) = &item.deadline {
                    heading.planning.deadline =
                        Some(format_timestamp(&deadline.date, user_tz, true)?);
                }

                if let Some(added) = &item.added_at {
                    let created = format_timestamp(added, user_tz, false)?;
                    heading.properties.insert("CREATED".into(), created);
                }

                heading.description = convert_links(&item.description);
                Ok(heading)
            }
        }

        /* ------------------------------ Traversal ------------------------------ */

        enum Step<'a> {
            Project { project: &'a Project, level: usize },
            Section { section: &'a Section, level: usize },
            Item { item: &'a Item, level: usize },
        }

        /// Lazy, single-pass heading sequence. Fused after the first error.
        pub struct Outline<'a> {
            index: OutlineIndex<'a>,
            options: OutlineOptions,
            sink: &'a dyn WarningSink,
            queue: std::vec::IntoIter<&'a Project>,
            stack: Vec<Step<'a>>,
            failed: bool,
        }

        /// Project every (non-archived, unless requested) project of `records`,
        /// logging warnings through the `log` facade.
        pub fn build(records: &RecordSet, options: OutlineOptions) -> Outline<'_> {
            build_with_sink(records, options, &LogWarnings)
        }

        pub fn build_with_sink<'a>(
            records: &'a RecordSet,
            options: OutlineOptions,
            sink: &'a dyn WarningSink,
        ) -> Outline<'a> {
            recurrence::warn_if_any_recurring(&records.items, sink);
            let index = OutlineIndex::new(records);
            let queue: Vec<_> = index.projects.values().copied().collect();
            Outline {
                index,
                options,
                sink,
                queue: queue.into_iter(),
                stack: Vec::new(),
                failed: false,
            }
        }

        /// Project a single project with its sections and items.
        pub fn build_for_project<'a>(
            records: &'a RecordSet,
            project_id: &RecordId,
            options: OutlineOptions,
        ) -> Result<Outline<'a>, OutlineError> {
            build_for_project_with_sink(records, project_id, options, &LogWarnings)
        }

        pub fn build_for_project_with_sink<'a>(
            records: &'a RecordSet,
            project_id: &RecordId,
            options: OutlineOptions,
            sink: &'a dyn WarningSink,
        ) -> Result<Outline<'a>, OutlineError> {
            let index = OutlineIndex::new(records);
            let project = index.project(project_id)?;
            let level = index.project_depth(project_id)?;
            recurrence::warn_if_any_recurring(index.items_of(project_id).iter().copied(), sink);
            Ok(Outline {
                index,
                options,
                sink,
                queue: Vec::new().into_iter(),
                stack: vec![Step::Project { project, level }],
                failed: false,
            })
        }

        impl<'a> Outline<'a> {
            /// Rendered heading blocks instead of `Heading` values.
            pub fn blocks(self) -> impl Iterator<Item = Result<String, OutlineError>> + 'a {
                self.map(|heading| heading.map(|h| render_block(&h)))
            }

            fn next_step(&mut self) -> Option<Result<Step<'a>, OutlineError>> {
                if let Some(step) = self.stack.pop() {
                    return Some(Ok(step));
                }
                loop {
                    let project = self.queue.next()?;
                    if project.is_archived && !self.options.include_archived {
                        continue;
                    }
                    return Some(
                        self.index
                            .project_depth(&project.id)
                            .map(|level| Step::Project { project, level }),
                    );
                }
            }

            fn expand(&mut self, step: Step<'a>) -> Result<Heading, OutlineError> {
                let Self {
                    index,
                    options,
                    sink,
                    stack,
                    ..
                } = self;
                match step {
                    Step::Project { project, level } => {
                        index.check_project_items(&project.id)?;
                        let heading = index.project_heading(project, level);

                        for &section in index.sections_of(&project.id).iter().rev() {
                            if section.is_archived && !options.include_archived {
                                continue;
                            }
                            stack.push(Step::Section {
                                section,
                                level: level + 1,
                            });
                        }
                        let unsectioned = index
                            .items_of(&project.id)
                            .iter()
                            .filter(|item| item.parent_id.is_none() && item.section_id.is_none());
                        for &item in unsectioned.rev() {
                            stack.push(Step::Item {
                                item,
                                level: level + 1,
                            });
                        }
                        Ok(heading)
                    }
                    Step::Section { section, level } => {
                        let heading = index.section_heading(section, level)?;
                        let roots = index.items_of(&section.project_id).iter().filter(|item| {
                            item.parent_id.is_none() && item.section_id.as_ref() == Some(&section.id)
                        });
                        for &item in roots.rev() {
                            stack.push(Step::Item {
                                item,
                                level: level + 1,
                            });
                        }
                        Ok(heading)
                    }
                    Step::Item { item, level } => {
                        let heading = index.item_heading(item, level, *sink)?;
                        let children: Vec<_> = index.children_of(item).collect();
                        for child in children.into_iter().rev() {
                            stack.push(Step::Item {
                                item: child,
                                level: level + 1,
                            });
                        }
                        Ok(heading)
                    }
                }
            }
        }

        impl<'a> Iterator for Outline<'a> {
            type Item = Result<Heading, OutlineError>;

            fn next(&mut self) -> Option<Self::Item> {
                if self.failed {
                    return None;
                }
                let result = match self.next_step()? {
                    Ok(step) => self.expand(step),
                    Err(err) => Err(err),
                };
                if result.is_err() {
                    self.failed = true;
                    self.stack.clear();
                }
                Some(result)
            }
        }

        impl std::iter::FusedIterator for Outline<'_> {}

    }

}

pub use format::{file_header, render_block, render_heading};
pub use projectors::outline_projector::{
    Outline, OutlineOptions, build, build_for_project, build_for_project_with_sink,
    build_with_sink,
};
