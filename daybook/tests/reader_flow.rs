use chrono::NaiveDate;
use daybook::core::{
    DAYS_IN_MONTH, Direction, DocumentId, EntryKey, Filter, Group, Layout, MONTH_NAMES,
};
use daybook::session::{Action, Reader};
use daybook::source::{DocumentSource, Fetcher, LoadError, load_document};
use daybook::state::{FileStore, KeyValueStore, StateStore};
use daybook::view::{ViewModel, ViewSettings};
use rand::{SeedableRng, rngs::StdRng};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

fn write_json(dir: &Path, name: &str, value: &serde_json::Value) -> DocumentSource {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
    let id = name.trim_end_matches(".json");
    DocumentSource::new(id, id, path.to_str().unwrap())
}

fn full_year() -> serde_json::Value {
    let mut days = Vec::new();
    for (month, name) in MONTH_NAMES.iter().enumerate() {
        for day in 1..=DAYS_IN_MONTH[month] {
            let reflection = if month == 6 && day == 4 {
                "Caf\u{e9} talk"
            } else {
                "Ordinary day"
            };
            days.push(json!({
                "month": name,
                "day": day,
                "title": format!("{name} {day}"),
                "quote": "Just for today.",
                "reflection": reflection,
            }));
        }
    }
    // malformed records are dropped, not fatal
    days.push(json!({"month": "Smarch", "day": 1}));
    days.push(json!("not even an object"));
    serde_json::Value::Array(days)
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

async fn open(
    dir: &TempDir,
    source: &DocumentSource,
) -> (Reader<FileStore>, ViewModel) {
    let store = StateStore::new(FileStore::open(dir.path().join("state").join("state.json")));
    let mut reader = Reader::new(store, ViewSettings::default(), source);
    let loaded = load_document(&Fetcher::new(false), source).await;
    let view = reader.open(source, loaded, today());
    (reader, view)
}

fn act(reader: &mut Reader<FileStore>, action: Action) -> ViewModel {
    reader.apply_with(action, today(), &mut StdRng::seed_from_u64(3))
}

#[tokio::test]
async fn calendar_document_resolves_dates_and_misses() {
    let dir = TempDir::new().unwrap();
    let source = write_json(dir.path(), "daily.json", &full_year());
    let (mut reader, view) = open(&dir, &source).await;

    assert_eq!(reader.session().index().len(), 366);
    assert_eq!(reader.session().index().layout(), Layout::Calendar);
    assert_eq!(view.current.unwrap().key.as_str(), "9-18");
    assert_eq!(view.filters.len(), 13);

    let view = act(&mut reader, Action::Explicit(EntryKey::from("11-31")));
    assert_eq!(view.current.unwrap().title, "December 31");

    let view = act(&mut reader, Action::Explicit(EntryKey::from("1-30")));
    assert_eq!(view.current.unwrap().key.as_str(), "11-31");
    assert!(view.status.unwrap().contains("1-30"));

    let view = act(&mut reader, Action::Step(Direction::Forward));
    assert_eq!(view.current.unwrap().key.as_str(), "0-1");
    let view = act(&mut reader, Action::Step(Direction::Backward));
    assert_eq!(view.current.unwrap().key.as_str(), "11-31");
    assert!(view.status.is_none());
}

#[tokio::test]
async fn accents_fold_and_notes_are_searchable() {
    let dir = TempDir::new().unwrap();
    let source = write_json(dir.path(), "daily.json", &full_year());
    let (mut reader, _) = open(&dir, &source).await;

    let view = act(&mut reader, Action::SetQuery("cafe".into()));
    assert_eq!(view.visible, vec![EntryKey::from("6-4")]);
    assert_eq!(view.search.results[0].snippet_html, "Caf\u{e9} talk");

    act(
        &mut reader,
        Action::EditNote {
            key: EntryKey::from("2-1"),
            text: "Cafe with my sponsor".into(),
        },
    );
    let view = act(&mut reader, Action::SetQuery("CAFÉ".into()));
    assert_eq!(view.search.count_label, "2 matches of 366");
    assert_eq!(view.visible, vec![EntryKey::from("2-1"), EntryKey::from("6-4")]);
}

#[tokio::test]
async fn section_document_groups_and_pages_results() {
    let dir = TempDir::new().unwrap();
    let mut sections = vec![
        json!({"type": "heading", "text": "Foreword", "level": 1}),
        json!({"type": "paragraph", "text": "Front matter"}),
        json!({"type": "heading", "text": "The Twelve Steps"}),
    ];
    for n in 0..45 {
        sections.push(json!({"type": "paragraph", "text": format!("Hope paragraph {n}"), "pageNumber": n + 1}));
    }
    sections.push(json!({"type": "heading", "text": "Tradition One"}));
    sections.push(json!({"type": "list", "text": "Unity", "items": ["one", "two"]}));
    let doc = json!({
        "metadata": {"title": "Twelve and Twelve", "author": "AA", "pageCount": "192"},
        "sections": sections,
    });
    let source = write_json(dir.path(), "book.json", &doc);
    let (mut reader, view) = open(&dir, &source).await;

    assert_eq!(view.header.title, "Twelve and Twelve");
    assert_eq!(view.header.meta_line.as_deref(), Some("By AA | 192 pages"));
    assert_eq!(view.resume.label, "Start");
    assert_eq!(view.current.as_ref().unwrap().key.as_str(), "0");

    let index = reader.session().index();
    let steps: Vec<_> = index.all().filter(|e| e.group == Group::Steps).collect();
    assert_eq!(steps.len(), 46);
    assert!(steps.iter().all(|e| e.anchor_key.as_str() == "2"));

    let view = act(&mut reader, Action::SetFilter(Filter::Group(Group::Traditions)));
    assert_eq!(view.search.count_label, "2 sections");
    assert_eq!(view.outline.len(), 1);

    act(&mut reader, Action::SetFilter(Filter::All));
    let shown: Vec<usize> = std::iter::once(act(&mut reader, Action::SetQuery("hope".into())))
        .chain((0..3).map(|_| act(&mut reader, Action::RevealMore)))
        .map(|view| view.search.shown)
        .collect();
    assert_eq!(shown, vec![20, 40, 45, 45]);
}

#[tokio::test]
async fn local_state_persists_per_document() {
    let dir = TempDir::new().unwrap();
    let source = write_json(dir.path(), "daily.json", &full_year());
    {
        let (mut reader, _) = open(&dir, &source).await;
        act(&mut reader, Action::Explicit(EntryKey::from("0-1")));
        act(&mut reader, Action::Explicit(EntryKey::from("0-1")));
        act(
            &mut reader,
            Action::EditNote {
                key: EntryKey::from("0-1"),
                text: "   ".into(),
            },
        );
        act(&mut reader, Action::Explicit(EntryKey::from("0-2")));
    }

    let (mut reader, view) = open(&dir, &source).await;
    let local = reader.session().local();
    assert_eq!(local.read_flags.len(), 2);
    assert_eq!(local.last_visited, Some(EntryKey::from("0-2")));
    assert_eq!(local.notes.get(&EntryKey::from("0-1")).map(String::as_str), Some(""));
    assert!(view.notes.is_empty());
    assert_eq!(view.resume.label, "Continue");

    let raw = reader
        .store()
        .backend()
        .get("daybook:daily")
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["lastSectionId"], "0-2");
    assert_eq!(parsed["read"]["0-1"], true);

    let view = act(&mut reader, Action::ResetProgress);
    assert_eq!(view.progress.read, 0);
    assert_eq!(view.resume.label, "Start");
    assert_eq!(reader.session().index().len(), 366);
    assert_eq!(reader.store().last_document(), Some(DocumentId::from("daily")));
}

#[tokio::test]
async fn corrupt_state_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::write(state_dir.join("state.json"), "{not json").unwrap();
    let source = write_json(dir.path(), "daily.json", &full_year());

    let (reader, view) = open(&dir, &source).await;
    assert_eq!(reader.session().local().read_count(), 0);
    assert!(view.placeholder.is_none());
}

#[tokio::test]
async fn load_failures_render_a_placeholder() {
    let dir = TempDir::new().unwrap();
    let remote = DocumentSource::new("remote", "Remote Book", "https://example.com/book.json");
    let (mut reader, view) = open(&dir, &remote).await;
    assert!(view.placeholder.unwrap().contains("network access is disabled"));
    assert!(view.current.is_none());
    let view = act(&mut reader, Action::Random);
    assert!(view.current.is_none());

    let missing = DocumentSource::new("gone", "Gone", dir.path().join("nope.json").to_str().unwrap());
    let loaded = load_document(&Fetcher::new(false), &missing).await;
    assert!(matches!(loaded, Err(LoadError::Io { .. })));
}
