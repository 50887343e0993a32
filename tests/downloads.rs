mod common;

use assert_matches::assert_matches;

use stplug::error::StplugError;
use stplug::status::{CancelOutcome, DownloadPhase, DownloadStatus, StatusRecord};

use common::{Fixture, MockHttp, id, read, temp_files, wait_until, zip_bytes};

const SCRIPT: &[u8] = b"addappid(123)\nsetManifestid(123, \"456\")\n";

fn wait_terminal(app: &stplug::app::App, value: u32) -> DownloadStatus {
    wait_until(|| app.poll_download(id(value)), DownloadStatus::is_terminal)
}

#[test]
fn unavailable_source_falls_through_to_next() {
    let fixture = Fixture::new();
    fixture.write_sources(&[
        ("Alpha", "https://alpha.test/<appid>.zip"),
        ("Beta", "https://beta.test/<appid>.zip"),
    ]);
    let http = MockHttp::new();
    http.route("https://alpha.test/123.zip", 404, Vec::new());
    http.route(
        "https://beta.test/123.zip",
        200,
        zip_bytes(&[("123.lua", SCRIPT), ("999.manifest", b"m")]),
    );
    let app = fixture.app(http.clone());

    app.start_download(id(123)).unwrap();
    let status = wait_terminal(&app, 123);

    assert_eq!(status.status, Some(DownloadPhase::Done));
    assert!(status.success);
    assert_eq!(status.api_used.as_deref(), Some("Beta"));
    let script = fixture.plugin_dir().join("123.lua");
    assert_eq!(status.installed_path.as_ref(), Some(&script));
    assert_eq!(
        read(&script),
        "addappid(123)\n--setManifestid(123, \"456\")\n"
    );
    assert!(
        fixture
            .root
            .join("steam/depotcache/999.manifest")
            .as_std_path()
            .exists()
    );
    assert_eq!(
        http.requested(),
        vec![
            "https://alpha.test/123.zip".to_string(),
            "https://beta.test/123.zip".to_string()
        ]
    );

    let roster = read(&fixture.config.data_dir.join("loadedappids.txt"));
    assert_eq!(roster, "123:UNKNOWN (123)\n");
    let events = read(&fixture.config.data_dir.join("appid_log.txt"));
    assert!(events.starts_with("[ADDED - Beta] 123 - UNKNOWN (123) - "));
    assert!(temp_files(&fixture.config.data_dir.join("temp_dl")).is_empty());
}

#[test]
fn non_zip_body_is_rejected_and_fallback_installs_placeholder() {
    let fixture = Fixture::new();
    fixture.write_sources(&[("Alpha", "https://alpha.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://alpha.test/77", 200, b"<html>not found</html>".to_vec());
    let app = fixture.app(http);

    app.start_download(id(77)).unwrap();
    let status = wait_terminal(&app, 77);

    assert_eq!(status.status, Some(DownloadPhase::Done));
    assert_eq!(status.api_used.as_deref(), Some("Fallback"));
    let script = read(&fixture.plugin_dir().join("77.lua"));
    assert!(script.contains("setAppID(77)"));
    assert!(temp_files(&fixture.config.data_dir.join("temp_dl")).is_empty());
}

#[test]
fn unexpected_status_and_network_errors_advance() {
    let fixture = Fixture::new();
    fixture.write_sources(&[
        ("Down", "https://down.test/<appid>"),
        ("Broken", "https://broken.test/<appid>"),
        ("Good", "https://good.test/<appid>"),
    ]);
    let http = MockHttp::new();
    http.route("https://broken.test/5", 500, Vec::new());
    http.route("https://good.test/5", 200, zip_bytes(&[("5.lua", b"addappid(5)\n")]));
    let app = fixture.app(http);

    app.start_download(id(5)).unwrap();
    let status = wait_terminal(&app, 5);
    assert_eq!(status.api_used.as_deref(), Some("Good"));
}

#[test]
fn empty_manifest_fails_without_fallback() {
    let fixture = Fixture::new();
    let app = fixture.app(MockHttp::new());

    app.start_download(id(9)).unwrap();
    let status = wait_terminal(&app, 9);

    assert_eq!(status.status, Some(DownloadPhase::Failed));
    assert_eq!(status.error.as_deref(), Some("No sources available"));
    assert!(!fixture.plugin_dir().join("9.lua").as_std_path().exists());
}

#[test]
fn failed_placeholder_reports_not_available() {
    let mut fixture = Fixture::new();
    fixture.config.steam_path = None;
    fixture.write_sources(&[("Alpha", "https://alpha.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://alpha.test/12", 404, Vec::new());
    let app = fixture.app(http);

    app.start_download(id(12)).unwrap();
    let status = wait_terminal(&app, 12);

    assert_eq!(status.status, Some(DownloadPhase::Failed));
    assert_eq!(status.error.as_deref(), Some("Not available on any source"));
    assert!(!status.success);
}

#[test]
fn archive_without_script_fails_processing() {
    let fixture = Fixture::new();
    fixture.write_sources(&[
        ("Alpha", "https://alpha.test/<appid>"),
        ("Beta", "https://beta.test/<appid>"),
    ]);
    let http = MockHttp::new();
    http.route("https://alpha.test/8", 200, zip_bytes(&[("readme.txt", b"hi")]));
    http.route("https://beta.test/8", 200, zip_bytes(&[("8.lua", b"x")]));
    let app = fixture.app(http.clone());

    app.start_download(id(8)).unwrap();
    let status = wait_terminal(&app, 8);

    assert_eq!(status.status, Some(DownloadPhase::Failed));
    assert!(
        status
            .error
            .as_deref()
            .unwrap()
            .starts_with("Processing failed")
    );
    assert_eq!(http.requested().len(), 1);
}

#[test]
fn cancel_before_bytes_leaves_no_partial_file() {
    let fixture = Fixture::new();
    fixture.write_sources(&[("Slow", "https://slow.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://slow.test/42", 200, zip_bytes(&[("42.lua", b"x")]));
    let release = http.gate("https://slow.test/42");
    let app = fixture.app(http);

    app.start_download(id(42)).unwrap();
    let downloading = wait_until(
        || app.poll_download(id(42)),
        |status| status.status == Some(DownloadPhase::Downloading),
    );
    let destination = downloading.destination.clone().unwrap();

    assert_eq!(app.cancel_download(id(42)), CancelOutcome::Cancelled);
    release.send(()).unwrap();

    wait_until(
        || destination.as_std_path().exists(),
        |exists| !exists,
    );
    let status = app.poll_download(id(42));
    assert_eq!(status.status, Some(DownloadPhase::Cancelled));
    assert_eq!(status.error.as_deref(), Some("Cancelled by user"));
    assert!(!destination.as_std_path().exists());
    assert!(!fixture.plugin_dir().join("42.lua").as_std_path().exists());
    assert_eq!(app.cancel_download(id(42)), CancelOutcome::NothingToCancel);
}

#[test]
fn cancel_during_name_lookup_rolls_back_install() {
    let mut fixture = Fixture::new();
    fixture.config.name_lookup_url = Some("https://names.test/<appid>".to_string());
    fixture.write_sources(&[("Alpha", "https://alpha.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://alpha.test/55", 200, zip_bytes(&[("55.lua", b"x")]));
    http.route(
        "https://names.test/55",
        200,
        br#"{"55": {"data": {"name": "Game"}}}"#.to_vec(),
    );
    let release = http.gate("https://names.test/55");
    let app = fixture.app(http.clone());
    let script = fixture.plugin_dir().join("55.lua");

    app.start_download(id(55)).unwrap();
    wait_until(
        || http.requested(),
        |urls| urls.iter().any(|url| url == "https://names.test/55"),
    );
    assert!(script.as_std_path().exists());

    assert_eq!(app.cancel_download(id(55)), CancelOutcome::Cancelled);
    release.send(()).unwrap();
    wait_until(|| script.as_std_path().exists(), |exists| !exists);

    let status = app.poll_download(id(55));
    assert_eq!(status.status, Some(DownloadPhase::Cancelled));
    assert!(!status.success);
    assert!(!script.as_std_path().exists());
    assert!(app.roster_entries().unwrap().is_empty());
    assert!(
        !fixture
            .config
            .data_dir
            .join("appid_log.txt")
            .as_std_path()
            .exists()
    );
}

#[test]
fn reset_mid_stream_moves_to_next_source() {
    let fixture = Fixture::new();
    fixture.write_sources(&[
        ("Flaky", "https://flaky.test/<appid>"),
        ("Steady", "https://steady.test/<appid>"),
    ]);
    let http = MockHttp::new();
    http.route(
        "https://flaky.test/60",
        200,
        zip_bytes(&[("60.lua", b"from flaky")]),
    );
    http.reset_after("https://flaky.test/60", 8);
    http.route(
        "https://steady.test/60",
        200,
        zip_bytes(&[("60.lua", b"from steady")]),
    );
    let app = fixture.app(http.clone());

    app.start_download(id(60)).unwrap();
    let status = wait_terminal(&app, 60);

    assert_eq!(status.status, Some(DownloadPhase::Done));
    assert_eq!(status.api_used.as_deref(), Some("Steady"));
    assert_eq!(read(&fixture.plugin_dir().join("60.lua")), "from steady");
    assert_eq!(http.requested().len(), 2);
    assert!(temp_files(&fixture.config.data_dir.join("temp_dl")).is_empty());
}

#[test]
fn concurrent_downloads_all_reach_the_roster() {
    let fixture = Fixture::new();
    fixture.write_sources(&[("Alpha", "https://alpha.test/<appid>")]);
    let http = MockHttp::new();
    for value in 1..=40u32 {
        let entry = format!("{value}.lua");
        let script = format!("addappid({value})\n");
        http.route(
            &format!("https://alpha.test/{value}"),
            200,
            zip_bytes(&[(entry.as_str(), script.as_bytes())]),
        );
    }
    let app = fixture.app(http);

    for value in 1..=40 {
        app.start_download(id(value)).unwrap();
    }
    for value in 1..=40 {
        assert!(wait_terminal(&app, value).success);
    }

    let mut ids = app
        .roster_entries()
        .unwrap()
        .into_iter()
        .map(|entry| entry.id.get())
        .collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(ids, (1..=40).collect::<Vec<_>>());
}

#[test]
fn second_start_while_running_is_rejected() {
    let fixture = Fixture::new();
    fixture.write_sources(&[("Slow", "https://slow.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://slow.test/3", 200, zip_bytes(&[("3.lua", b"x")]));
    let release = http.gate("https://slow.test/3");
    let app = fixture.app(http);

    app.start_download(id(3)).unwrap();
    assert_matches!(
        app.start_download(id(3)),
        Err(StplugError::AlreadyRunning(3))
    );
    release.send(()).unwrap();
    let status = wait_terminal(&app, 3);
    assert!(status.success);

    // A finished record may be restarted.
    assert!(app.start_download(id(3)).is_ok());
    wait_terminal(&app, 3);
}

#[test]
fn unknown_id_polls_empty_and_cancel_is_noop() {
    let fixture = Fixture::new();
    let app = fixture.app(MockHttp::new());
    assert_eq!(app.poll_download(id(1)), DownloadStatus::default());
    assert_eq!(app.cancel_download(id(1)), CancelOutcome::NothingToCancel);
}

#[test]
fn installed_scripts_and_removal() {
    let fixture = Fixture::new();
    let plugin_dir = fixture.plugin_dir();
    std::fs::create_dir_all(plugin_dir.as_std_path()).unwrap();
    std::fs::write(plugin_dir.join("20.lua").as_std_path(), "a").unwrap();
    std::fs::write(plugin_dir.join("10.lua.disabled").as_std_path(), "bb").unwrap();
    std::fs::write(plugin_dir.join("notes.lua").as_std_path(), "c").unwrap();
    let app = fixture.app(MockHttp::new());

    let scripts = app.installed_scripts().unwrap().scripts;
    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[0].id, id(10));
    assert!(scripts[0].disabled);
    assert_eq!(scripts[0].size, 2);
    assert_eq!(scripts[1].file_name, "20.lua");

    assert!(app.has_script(id(10)).unwrap());
    let removed = app.remove_script(id(10)).unwrap();
    assert_eq!(removed.removed, vec![plugin_dir.join("10.lua.disabled")]);
    assert!(!app.has_script(id(10)).unwrap());
    assert!(app.remove_script(id(10)).unwrap().removed.is_empty());
}

#[test]
fn roster_tracks_installs_and_dismisses() {
    let fixture = Fixture::new();
    fixture.write_sources(&[("Alpha", "https://alpha.test/<appid>")]);
    let http = MockHttp::new();
    http.route("https://alpha.test/31", 200, zip_bytes(&[("31.lua", b"x")]));
    let app = fixture.app(http);

    app.start_download(id(31)).unwrap();
    wait_terminal(&app, 31);
    let entries = app.roster_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id(31));

    app.remove_script(id(31)).unwrap();
    assert!(app.roster_entries().unwrap().is_empty());
    let events = read(&fixture.config.data_dir.join("appid_log.txt"));
    assert!(events.contains("[REMOVED] 31 - UNKNOWN (31)"));

    app.dismiss_roster().unwrap();
    assert!(app.roster_entries().unwrap().is_empty());
}
