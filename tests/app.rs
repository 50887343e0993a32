mod common;

use std::sync::Mutex;

use stplug::app::{ProgressEvent, ProgressSink};
use stplug::status::DownloadPhase;

use common::{Fixture, MockHttp, id, read, zip_bytes};

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

#[test]
fn sources_are_normalized_and_filtered() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.config.data_dir.as_std_path()).unwrap();
    std::fs::write(
        fixture.config.sources_file.as_std_path(),
        r#""api_list": [
            {"name": "One", "url": "https://one.test/<appid>", "enabled": true},
            {"name": "Off", "url": "https://off.test/<appid>"},
            {"name": "Two", "url": "https://two.test/<appid>", "success_code": 201, "enabled": true},
        ]"#,
    )
    .unwrap();
    let app = fixture.app(MockHttp::new());

    let sources = app.sources().unwrap().sources;
    let names = sources
        .iter()
        .map(|source| source.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["One", "Two"]);
    assert_eq!(sources[1].success_code, 201);
    assert!(read(&fixture.config.sources_file).starts_with('{'));
}

#[test]
fn wait_for_download_reports_progress_until_done() {
    let fixture = Fixture::new();
    fixture.write_sources(&[("Alpha", "https://alpha.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://alpha.test/12", 200, zip_bytes(&[("12.lua", b"x")]));
    let app = fixture.app(http);
    let sink = RecordingSink::default();

    app.start_download(id(12)).unwrap();
    let status = app.wait_for_download(id(12), &sink);

    assert_eq!(status.status, Some(DownloadPhase::Done));
    let messages = sink.messages.lock().unwrap();
    assert!(messages.last().unwrap().starts_with("Done"));
}

#[test]
fn wait_on_idle_id_returns_immediately() {
    let fixture = Fixture::new();
    let app = fixture.app(MockHttp::new());
    let sink = RecordingSink::default();
    let status = app.wait_for_fix(id(5), &sink);
    assert_eq!(status.status, None);
    assert!(sink.messages.lock().unwrap().is_empty());
}
