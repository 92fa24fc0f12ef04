use orthotask::assets::{AssetRetriever, AssetSource};
use orthotask::config::Config;
use orthotask::error::ApiError;
use orthotask::tasks::Task;
use tempfile::TempDir;

fn setup() -> (TempDir, Config, AssetRetriever, Task) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path());
    let retriever = AssetRetriever::new(config.clone());
    let task = Task::new("p1");
    std::fs::create_dir_all(config.assets_dir(&task.id)).unwrap();
    (dir, config, retriever, task)
}

#[test]
fn raw_paths_resolve_within_the_asset_tree() {
    let (_dir, cfg, retriever, task) = setup();
    let assets = cfg.assets_dir(&task.id);
    std::fs::create_dir_all(assets.join("odm_texturing")).unwrap();
    std::fs::write(assets.join("odm_texturing/model.mtl"), b"mtl").unwrap();

    let p = retriever
        .resolve_raw_path(&task, "odm_texturing/model.mtl")
        .unwrap();
    assert!(p.ends_with("odm_texturing/model.mtl"));
}

#[test]
fn traversal_is_indistinguishable_from_missing() {
    let (_dir, cfg, retriever, task) = setup();
    std::fs::write(cfg.task_dir(&task.id).join("secret.txt"), b"s").unwrap();

    // One escapes, one simply does not exist; same answer for both.
    let escape = retriever
        .resolve_raw_path(&task, "../secret.txt")
        .unwrap_err();
    let missing = retriever.resolve_raw_path(&task, "nope.txt").unwrap_err();
    assert!(matches!(escape, ApiError::NotFound));
    assert!(matches!(missing, ApiError::NotFound));

    let deep = retriever
        .resolve_raw_path(&task, "a/../../../../etc/passwd")
        .unwrap_err();
    assert!(matches!(deep, ApiError::NotFound));
}

#[test]
fn absolute_raw_paths_are_refused() {
    let (_dir, _cfg, retriever, task) = setup();
    let err = retriever.resolve_raw_path(&task, "/etc/passwd").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));
}

#[test]
fn directories_are_not_served() {
    let (_dir, cfg, retriever, task) = setup();
    std::fs::create_dir_all(cfg.assets_dir(&task.id).join("odm_dem")).unwrap();
    let err = retriever.resolve_raw_path(&task, "odm_dem").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));
}

#[cfg(unix)]
#[test]
fn symlinks_out_of_the_tree_are_refused() {
    let (_dir, cfg, retriever, task) = setup();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("loot.txt"), b"x").unwrap();
    std::os::unix::fs::symlink(outside.path(), cfg.assets_dir(&task.id).join("link")).unwrap();

    let err = retriever.resolve_raw_path(&task, "link/loot.txt").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));
}

#[test]
fn unknown_selector_is_not_found() {
    let (_dir, _cfg, retriever, task) = setup();
    let err = retriever.resolve_asset(&task, "texture_pack").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));
}

#[test]
fn selector_requires_registration_even_if_the_file_exists() {
    let (_dir, cfg, retriever, mut task) = setup();
    let ortho = cfg
        .assets_dir(&task.id)
        .join("odm_orthophoto/odm_orthophoto.tif");
    std::fs::create_dir_all(ortho.parent().unwrap()).unwrap();
    std::fs::write(&ortho, b"tif").unwrap();

    // On disk but never registered by the worker.
    let err = retriever.resolve_asset(&task, "orthophoto").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));

    task.available_assets.insert("orthophoto".to_string());
    let source = retriever.resolve_asset(&task, "orthophoto").unwrap();
    assert!(matches!(source, AssetSource::File(_)));
}

#[test]
fn registered_selector_with_missing_file_is_not_found() {
    let (_dir, _cfg, retriever, mut task) = setup();
    task.available_assets.insert("dsm".to_string());
    let err = retriever.resolve_asset(&task, "dsm").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));
}

#[test]
fn all_selector_requires_produced_assets() {
    let (_dir, cfg, retriever, mut task) = setup();

    let err = retriever.resolve_asset(&task, "all").unwrap_err();
    assert!(matches!(err, ApiError::NotFound));

    task.available_assets.insert("report".to_string());
    std::fs::write(cfg.assets_dir(&task.id).join("report.pdf"), b"pdf").unwrap();
    let source = retriever.resolve_asset(&task, "all").unwrap();
    let AssetSource::Archive(entries) = source else {
        panic!("expected an archive source");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "report.pdf");
}
