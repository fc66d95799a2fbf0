use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use log4rs::{
    Config,
    append::console::{ConsoleAppender, Target},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};
use todoist2org::core::{Heading, Project, RecordId, RecordSet};
use todoist2org::{OutlineOptions, build, build_for_project, file_header, render_block};

const DEFAULT_TITLE: &str = "Converted Todoist Projects";

#[derive(Debug, Parser)]
#[command(
    name = "todoist2org",
    about = "Convert Todoist projects, sections and items into Org mode headings",
    version
)]
struct Cli {
    /// Todoist Sync API JSON dump (`-` reads stdin).
    input: PathBuf,
    /// Write to this file instead of stdout. An existing directory gets one
    /// `<project name>.org` file per project.
    #[arg(short, long)]
    output_file: Option<PathBuf>,
    /// Append to the output file(s) instead of overwriting them.
    #[arg(short, long, requires = "output_file")]
    append: bool,
    /// Include archived projects and sections (tagged :ARCHIVED:).
    #[arg(long)]
    include_archived: bool,
    /// Only convert the project with this id.
    #[arg(long)]
    project: Option<String>,
    /// File title; defaults to the output file name.
    #[arg(long)]
    title: Option<String>,
    /// Skip the #+AUTHOR/#+DATE/#+TITLE header.
    #[arg(long)]
    no_header: bool,
    /// Output format.
    #[arg(long, value_enum, default_value_t = EmitFormat::Org)]
    emit: EmitFormat,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EmitFormat {
    Org,
    Json,
}

impl EmitFormat {
    fn extension(self) -> &'static str {
        match self {
            EmitFormat::Org => "org",
            EmitFormat::Json => "json",
        }
    }
}

/// How a list of headings becomes file text.
struct Document<'a> {
    emit: EmitFormat,
    author: &'a str,
    header: bool,
    generated: NaiveDateTime,
}

impl Document<'_> {
    fn render(&self, title: &str, headings: &[Heading]) -> Result<String> {
        match self.emit {
            EmitFormat::Org => {
                let header = self
                    .header
                    .then(|| file_header(self.author, title, self.generated));
                Ok(render_document(header.as_deref(), headings))
            }
            EmitFormat::Json => {
                let mut json = serde_json::to_string_pretty(headings)
                    .context("serializing headings")?;
                json.push('\n');
                Ok(json)
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let records = read_record_set(&cli.input)?;
    log::debug!(
        "loaded {} projects, {} sections, {} items, {} labels",
        records.projects.len(),
        records.sections.len(),
        records.items.len(),
        records.labels.len()
    );

    let options = OutlineOptions {
        include_archived: cli.include_archived,
    };
    let document = Document {
        emit: cli.emit,
        author: &records.user.full_name,
        header: !cli.no_header,
        generated: Local::now().naive_local(),
    };

    if let Some(dir) = cli.output_file.as_deref().filter(|path| path.is_dir()) {
        let files = collect_project_files(&records, cli.project.as_deref(), options)?;
        let written = write_project_files(dir, &files, &document, cli.append)?;
        log::info!("wrote {} project files to {:?}", written.len(), dir);
        return Ok(());
    }

    let headings = collect_headings(&records, cli.project.as_deref(), options)?;
    let title = resolve_title(cli.title.as_deref(), cli.output_file.as_deref());
    let text = document.render(&title, &headings)?;

    match &cli.output_file {
        Some(path) => {
            write_output(path, &text, cli.append)?;
            log::info!("wrote {} headings to {:?}", headings.len(), path);
        }
        None => io::stdout()
            .write_all(text.as_bytes())
            .context("writing to stdout")?,
    }
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l}: {m}{n}")))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .context("building log configuration")?;

    log4rs::init_config(config).context("initializing logging")?;
    Ok(())
}

fn read_record_set(input: &Path) -> Result<RecordSet> {
    let text = if input == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        buf
    } else {
        fs::read_to_string(input).with_context(|| format!("reading {:?}", input))?
    };
    serde_json::from_str(&text).with_context(|| format!("parsing Todoist data from {:?}", input))
}

/// Run the whole projection before anything is written, so a failure never
/// leaves a half-written outline behind.
fn collect_headings(
    records: &RecordSet,
    project: Option<&str>,
    options: OutlineOptions,
) -> Result<Vec<Heading>> {
    let headings = match project {
        Some(id) => {
            let id = RecordId::from(id);
            build_for_project(records, &id, options)
                .with_context(|| format!("selecting project {id}"))?
                .collect::<Result<Vec<_>, _>>()
        }
        None => build(records, options).collect::<Result<Vec<_>, _>>(),
    };
    headings.context("converting Todoist data")
}

/// Headings per project for directory output, all converted before any file
/// is touched.
fn collect_project_files<'a>(
    records: &'a RecordSet,
    project: Option<&str>,
    options: OutlineOptions,
) -> Result<Vec<(&'a Project, Vec<Heading>)>> {
    let selected: Vec<&Project> = match project {
        Some(id) => {
            let found = records
                .projects
                .iter()
                .find(|p| p.id.as_str() == id)
                .with_context(|| format!("selecting project {id}: no such project"))?;
            vec![found]
        }
        None => records
            .projects
            .iter()
            .filter(|p| options.include_archived || !p.is_archived)
            .collect(),
    };

    selected
        .into_iter()
        .map(|project| {
            let headings = build_for_project(records, &project.id, options)
                .and_then(|outline| outline.collect::<Result<Vec<_>, _>>())
                .with_context(|| format!("converting project {:?}", project.name))?;
            Ok((project, headings))
        })
        .collect()
}

fn write_project_files(
    dir: &Path,
    files: &[(&Project, Vec<Heading>)],
    document: &Document<'_>,
    append: bool,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(files.len());
    for (project, headings) in files {
        let path = dir.join(project_file_name(&project.name, document.emit));
        let text = document.render(&project.name, headings)?;
        write_output(&path, &text, append)?;
        log::debug!("wrote {} headings to {:?}", headings.len(), path);
        written.push(path);
    }
    Ok(written)
}

/// Project names may hold path separators; those become `_`.
fn project_file_name(name: &str, emit: EmitFormat) -> String {
    let stem: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!("{stem}.{}", emit.extension())
}

fn resolve_title(explicit: Option<&str>, output: Option<&Path>) -> String {
    if let Some(title) = explicit {
        return title.to_string();
    }
    output
        .and_then(|path| path.file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Header lines, a blank line, then each heading block followed by a blank line.
fn render_document(header: Option<&[String]>, headings: &[Heading]) -> String {
    let mut out = String::new();
    if let Some(lines) = header {
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    for heading in headings {
        out.push_str(&render_block(heading));
        out.push('\n');
    }
    out
}

fn write_output(path: &Path, text: &str, append: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("writing {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::fs;

    fn sample_records() -> RecordSet {
        serde_json::from_value(json!({
            "user": {"full_name": "Ada Lovelace", "tz_info": {"timezone": "UTC"}},
            "projects": [
                {"id": 1, "name": "Home"},
                {"id": 2, "name": "Work"},
            ],
            "items": [
                {"id": 10, "project_id": 1, "content": "Buy milk"},
                {"id": 11, "project_id": 2, "content": "Write report", "priority": 3},
            ],
        }))
        .expect("records")
    }

    #[test]
    fn title_prefers_explicit_then_output_stem() {
        assert_eq!(resolve_title(Some("Mine"), Some(Path::new("x.org"))), "Mine");
        assert_eq!(
            resolve_title(None, Some(Path::new("/tmp/todo/tasks.org"))),
            "tasks"
        );
        assert_eq!(resolve_title(None, None), DEFAULT_TITLE);
    }

    #[test]
    fn document_has_header_blank_line_and_spaced_headings() {
        let records = sample_records();
        let headings = collect_headings(&records, None, OutlineOptions::default()).unwrap();
        let now = NaiveDate::from_ymd_opt(2024, 5, 5)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let header = file_header(&records.user.full_name, "Tasks", now);

        let text = render_document(Some(&header), &headings);
        let expected = "\
#+AUTHOR: Ada Lovelace
#+DATE: [2024-05-05 Sun 10:00]
#+TITLE: Tasks

* Home
  :PROPERTIES:
  :CATEGORY: Home
  :END:

** TODO Buy milk

* Work
  :PROPERTIES:
  :CATEGORY: Work
  :END:

** TODO [#B] Write report

";
        assert_eq!(text, expected);
    }

    #[test]
    fn single_project_selection() {
        let records = sample_records();
        let headings = collect_headings(&records, Some("2"), OutlineOptions::default()).unwrap();
        let contents: Vec<_> = headings.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["Work", "Write report"]);

        let err = collect_headings(&records, Some("3"), OutlineOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("unresolved project reference 3"));
    }

    #[test]
    fn conversion_errors_surface_before_output() {
        let records: RecordSet = serde_json::from_value(json!({
            "projects": [{"id": 1, "name": "Home"}],
            "items": [{"id": 10, "project_id": 1, "content": "x", "priority": 9}],
        }))
        .unwrap();
        let err = collect_headings(&records, None, OutlineOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("priority 9 is out of range"));
    }

    #[test]
    fn reads_record_set_from_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("sync.json");
        fs::write(
            &path,
            r#"{"projects": [{"id": "p1", "name": "Inbox"}], "user": {"full_name": "Ada"}}"#,
        )
        .expect("write json");

        let records = read_record_set(&path).expect("read");
        assert_eq!(records.projects[0].name, "Inbox");
        assert_eq!(records.user.timezone(), "UTC");

        let missing = read_record_set(&tmp.path().join("nope.json")).unwrap_err();
        assert!(format!("{missing:#}").contains("reading"));
    }

    #[test]
    fn directory_output_writes_one_file_per_project() {
        let mut records = sample_records();
        records.projects.push(serde_json::from_value(json!(
            {"id": 3, "name": "Old/Stuff", "is_archived": true}
        )).unwrap());
        let tmp = tempfile::tempdir().expect("tempdir");
        let document = Document {
            emit: EmitFormat::Org,
            author: "Ada Lovelace",
            header: false,
            generated: NaiveDate::from_ymd_opt(2024, 5, 5)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        };

        let files = collect_project_files(&records, None, OutlineOptions::default()).unwrap();
        let written = write_project_files(tmp.path(), &files, &document, false).unwrap();
        assert_eq!(
            written,
            vec![tmp.path().join("Home.org"), tmp.path().join("Work.org")]
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("Work.org")).unwrap(),
            "* Work\n  :PROPERTIES:\n  :CATEGORY: Work\n  :END:\n\n** TODO [#B] Write report\n\n"
        );

        write_project_files(tmp.path(), &files, &document, true).unwrap();
        let home = fs::read_to_string(tmp.path().join("Home.org")).unwrap();
        assert_eq!(home.matches("* Home\n").count(), 2);

        let options = OutlineOptions {
            include_archived: true,
        };
        let files = collect_project_files(&records, Some("3"), options).unwrap();
        let written = write_project_files(tmp.path(), &files, &document, false).unwrap();
        assert_eq!(written, vec![tmp.path().join("Old_Stuff.org")]);

        let err = collect_project_files(&records, Some("404"), options).unwrap_err();
        assert!(format!("{err:#}").contains("no such project"));
    }

    #[test]
    fn write_output_truncates_or_appends() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("out.org");

        write_output(&path, "first\n", false).expect("write");
        write_output(&path, "second\n", true).expect("append");
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        write_output(&path, "third\n", false).expect("overwrite");
        assert_eq!(fs::read_to_string(&path).unwrap(), "third\n");
    }
}
