use axum::http::header;
use futures::StreamExt;
use orthotask::assets::{archive_response, file_response, AssetRetriever, AssetSource};
use orthotask::config::Config;
use orthotask::tasks::{Task, TaskStore};
use orthotask::worker::register_available_assets;
use tempfile::TempDir;

fn setup() -> (TempDir, Config, AssetRetriever, Task) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path());
    let retriever = AssetRetriever::new(config.clone());
    let task = Task::new("p1");
    std::fs::create_dir_all(config.assets_dir(&task.id)).unwrap();
    (dir, config, retriever, task)
}

fn write_asset(config: &Config, task: &Task, rel: &str, content: &[u8]) {
    let path = config.assets_dir(&task.id).join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn small_files_are_buffered_with_content_length() {
    let (dir, _cfg, _retriever, _task) = setup();
    let path = dir.path().join("small.tif");
    std::fs::write(&path, b"tiny orthophoto").unwrap();

    let resp = file_response(&path, "attachment", None, false).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get(header::CONTENT_LENGTH).unwrap(),
        &"15".parse::<axum::http::HeaderValue>().unwrap()
    );
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/tiff"
    );
    assert_eq!(
        resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=small.tif"
    );
}

#[tokio::test]
async fn forced_streaming_skips_content_length() {
    let (dir, _cfg, _retriever, _task) = setup();
    let path = dir.path().join("small.bin");
    std::fs::write(&path, b"payload").unwrap();

    let resp = file_response(&path, "attachment", None, true).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"payload");
}

#[tokio::test]
async fn download_name_overrides_the_file_name() {
    let (dir, _cfg, _retriever, _task) = setup();
    let path = dir.path().join("dsm.tif");
    std::fs::write(&path, b"dsm").unwrap();

    let resp = file_response(&path, "attachment", Some("survey-dsm.tif".to_string()), false)
        .await
        .unwrap();
    assert_eq!(
        resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=survey-dsm.tif"
    );
}

#[tokio::test]
async fn inline_disposition_for_raw_viewer_access() {
    let (dir, _cfg, _retriever, _task) = setup();
    let path = dir.path().join("tile.png");
    std::fs::write(&path, b"png").unwrap();

    let resp = file_response(&path, "inline", None, false).await.unwrap();
    assert_eq!(
        resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "inline; filename=tile.png"
    );
}

#[tokio::test]
async fn archive_response_streams_a_valid_zip() {
    let (cfg_dir, cfg, retriever, mut task) = setup();
    let _ = cfg_dir;
    write_asset(&cfg, &task, "odm_report/report.pdf", b"pdf body");
    write_asset(&cfg, &task, "odm_dem/dsm.tif", b"dsm body");
    task.available_assets.insert("report".to_string());
    task.available_assets.insert("dsm".to_string());

    let AssetSource::Archive(entries) = retriever.resolve_asset(&task, "all").unwrap() else {
        panic!("expected an archive source");
    };
    // Entries come out in a stable name order.
    let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["odm_dem/dsm.tif", "odm_report/report.pdf"]);

    let resp = archive_response(entries, "survey-all.zip".to_string()).unwrap();
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/zip"
    );
    assert_eq!(
        resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=survey-all.zip"
    );

    let mut body = resp.into_body().into_data_stream();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    // Local header magic up front, EOCD with the entry count at the end.
    assert_eq!(&bytes[..4], b"PK\x03\x04");
    let eocd = &bytes[bytes.len() - 22..];
    assert_eq!(&eocd[..4], b"PK\x05\x06");
    assert_eq!(u16::from_le_bytes([eocd[10], eocd[11]]), 2);
    assert!(bytes.windows(8).any(|w| w == b"pdf body"));
}

#[test]
fn download_filename_is_derived_from_the_task() {
    let (_dir, _cfg, retriever, mut task) = setup();

    let anon = retriever.download_filename(&task, "orthophoto");
    assert!(anon.starts_with(&task.id.to_string()));

    task.name = Some("field survey/2".to_string());
    assert_eq!(
        retriever.download_filename(&task, "orthophoto"),
        "field_survey_2-orthophoto"
    );
    assert_eq!(
        retriever.download_filename(&task, "all"),
        "field_survey_2-all.zip"
    );
}

#[test]
fn worker_registers_assets_found_on_disk() {
    let (_dir, cfg, _retriever, task) = setup();
    write_asset(&cfg, &task, "odm_orthophoto/odm_orthophoto.tif", b"tif");
    write_asset(&cfg, &task, "odm_report/report.pdf", b"pdf");

    let store = TaskStore::new();
    let id = store.insert(task);
    register_available_assets(&store, &cfg, id);

    let task = store.get(&id).unwrap();
    assert!(task.available_assets.contains("orthophoto"));
    assert!(task.available_assets.contains("report"));
    assert!(task.available_assets.contains("all"));
    // Nothing produced a DSM, so it stays unavailable.
    assert!(!task.available_assets.contains("dsm"));
}

#[test]
fn no_outputs_means_no_all_bundle() {
    let (_dir, cfg, _retriever, task) = setup();
    let store = TaskStore::new();
    let id = store.insert(task);
    register_available_assets(&store, &cfg, id);
    assert!(store.get(&id).unwrap().available_assets.is_empty());
}
