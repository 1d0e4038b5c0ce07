mod harness;

use std::path::PathBuf;

use harness::fake::*;
use hudscript::config::OverlayConfig;
use hudscript::renderer::{HeapKind, Pipeline};
use hudscript::Error;
use image::{Rgba, RgbaImage};
use imgui::TextureId;

fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hudscript-{}-{name}", std::process::id()))
}

fn png(name: &str, width: u32, height: u32) -> PathBuf {
    let path = temp_file(name);
    RgbaImage::from_pixel(width, height, Rgba([255, 0, 128, 255])).save(&path).unwrap();
    path
}

fn active(config: OverlayConfig) -> (FakeBackend, Pipeline<FakeBackend, FakeScript>, FakeSwapChain) {
    harness::setup_tracing();
    let backend = FakeBackend::new();
    let script = FakeScript::new(1).with_script("main", 1, true);
    let mut pipeline = Pipeline::new(backend.clone(), script, config);
    let swap_chain = FakeSwapChain::new(2);

    pipeline.execute_command_lists(&FakeQueue::direct(1), || ());
    pipeline.present(&swap_chain, || ());
    (backend, pipeline, swap_chain)
}

#[test]
fn loads_report_dimensions_and_take_increasing_slots() {
    let (backend, pipeline, _swap_chain) = active(OverlayConfig::default());
    let wide = png("wide.png", 3, 2);
    let tall = png("tall.png", 1, 5);

    let load = pipeline.texture_loader();
    let first = load(wide.as_path()).unwrap();
    let second = load(tall.as_path()).unwrap();

    assert_eq!((first.width, first.height), (3, 2));
    assert_eq!((second.width, second.height), (1, 5));
    assert_eq!(first.texture_id, TextureId::from(1));
    assert_eq!(second.texture_id, TextureId::from(2));

    // Rows are padded to the upload pitch alignment.
    assert_eq!(backend.count(&Op::Upload { width: 3, height: 2, pitch: 256, len: 512 }), 1);
    assert_eq!(backend.count(&Op::Upload { width: 1, height: 5, pitch: 256, len: 1280 }), 1);
}

#[test]
fn undecodable_files_consume_no_slot() {
    let (backend, pipeline, _swap_chain) = active(OverlayConfig::default());
    let garbage = temp_file("garbage.png");
    std::fs::write(&garbage, b"definitely not a png").unwrap();
    let good = png("good.png", 2, 2);

    let load = pipeline.texture_loader();
    assert!(matches!(load(garbage.as_path()), Err(Error::Decode(_))));
    assert!(load(temp_file("missing.png").as_path()).is_err());
    assert_eq!(load(good.as_path()).unwrap().texture_id, TextureId::from(1));
    assert_eq!(backend.count(&Op::TextureView(1)), 1);
}

#[test]
fn heap_exhaustion_is_reported() {
    // Two back buffers plus one texture slot: slots 1 and 2 are usable.
    let (_, pipeline, _swap_chain) = active(OverlayConfig::default().with_texture_slots(1));
    let path = png("small.png", 1, 1);

    let load = pipeline.texture_loader();
    load(path.as_path()).unwrap();
    load(path.as_path()).unwrap();
    assert!(matches!(load(path.as_path()), Err(Error::HeapExhausted { slot: 3, capacity: 3 })));
}

#[test]
fn loading_while_uninitialized_fails() {
    let (_, mut pipeline, _swap_chain) = active(OverlayConfig::default());
    let path = png("resize.png", 1, 1);

    let load = pipeline.texture_loader();
    pipeline.resize_buffers(|| ());
    assert!(matches!(load(path.as_path()), Err(Error::NotInitialized)));
}

#[test]
fn slots_keep_increasing_across_reinitialization() {
    let (_, mut pipeline, swap_chain) = active(OverlayConfig::default());
    let path = png("reinit.png", 1, 1);

    let load = pipeline.texture_loader();
    assert_eq!(load(path.as_path()).unwrap().texture_id, TextureId::from(1));

    pipeline.resize_buffers(|| ());
    pipeline.present(&swap_chain, || ());
    assert_eq!(load(path.as_path()).unwrap().texture_id, TextureId::from(2));
}

#[test]
fn reloading_after_each_resize_never_exhausts_the_heap() {
    let (backend, mut pipeline, swap_chain) = active(OverlayConfig::default().with_texture_slots(1));
    let path = png("cycles.png", 1, 1);
    let load = pipeline.texture_loader();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(load(path.as_path()).unwrap().texture_id);
        pipeline.resize_buffers(|| ());
        pipeline.present(&swap_chain, || ());
    }

    assert_eq!(ids, (1..=4).map(TextureId::from).collect::<Vec<_>>());

    // Each new heap leaves room for one texture past the slot counter.
    for capacity in [3, 4, 5] {
        assert!(backend.count(&Op::CreateHeap(HeapKind::ShaderResource, capacity)) >= 1);
    }
    assert_eq!(pipeline.frames().map(|f| f.srv_capacity), Some(6));
}

#[test]
fn scripts_load_through_the_registered_binding() {
    let (_, mut pipeline, swap_chain) = active(OverlayConfig::default());
    pipeline.script_mut().load_on_run.push(png("script.png", 4, 4));

    pipeline.present(&swap_chain, || ());

    let loaded = &pipeline.script().loaded;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].as_ref().map(|t| t.width).ok(), Some(4));
}

#[test]
fn textures_are_released_with_the_overlay() {
    let (backend, mut pipeline, _swap_chain) = active(OverlayConfig::default());
    let path = png("release.png", 1, 1);

    pipeline.texture_loader()(path.as_path()).unwrap();
    pipeline.resize_buffers(|| ());
    assert_eq!(backend.live(), 0);
}

#[test]
#[should_panic(expected = "failed")]
fn upload_failure_panics() {
    let (backend, pipeline, _swap_chain) = active(OverlayConfig::default());
    let path = png("panic.png", 1, 1);

    backend.fail_at(Some(Step::Upload));
    let _ = pipeline.texture_loader()(path.as_path());
}
