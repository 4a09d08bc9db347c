use chrono::Local;
use eframe::egui;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ── Constants ───────────────────────────────────────────────────────────────

/// Per-run manifest of saved patches, one `<filename> <flag>` line each.
const MANIFEST_FILE: &str = "description.txt";
const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";
const FULLSCREEN: bool = false;
/// Edge length of every saved patch, in pixels.
const PATCH_SIZE: u32 = 150;
/// Selection size change per wheel notch, in source-image pixels.
const BOX_SIZE_STEP: u32 = 4;
const DEFAULT_BOX_SIZE: u32 = 100;
const PATCH_EXT: &str = "jpg";
const PRESENT_COLOR: [u8; 4] = [66, 128, 66, 255];
const ABSENT_COLOR: [u8; 4] = [128, 66, 66, 255];

// ── Data Model ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Label {
    Present,
    Absent,
}

impl Label {
    /// The flag character used in patch filenames and manifest lines.
    fn flag(self) -> &'static str {
        match self {
            Label::Present => "1",
            Label::Absent => "0",
        }
    }

    fn color(self) -> [u8; 4] {
        match self {
            Label::Present => PRESENT_COLOR,
            Label::Absent => ABSENT_COLOR,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WheelDirection {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LabelButton {
    Primary,
    Secondary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    PointerMove { x: i32, y: i32 },
    ButtonRelease { button: LabelButton, ctrl: bool },
    WheelScroll(WheelDirection),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Effect {
    CommitPatch(Label),
}

/// Top-left corner and edge length of the selection square, in source-image
/// pixels. The position follows the pointer exactly and may lie outside the
/// image; clipping happens at crop time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RectState {
    x: i32,
    y: i32,
    size: u32,
}

// ── Session ─────────────────────────────────────────────────────────────────

/// Mutable interaction state scoped to one displayed image.
///
/// `source` is never written after load and is the sole input to crops;
/// `canvas` accumulates committed rectangles for display only.
struct Session {
    stem: String,
    width: u32,
    height: u32,
    source: RgbaImage,
    canvas: RgbaImage,
    rect: RectState,
    patch_index: u32,
}

impl Session {
    fn new(stem: String, source: RgbaImage) -> Self {
        let (width, height) = source.dimensions();
        let canvas = source.clone();
        Self {
            stem,
            width,
            height,
            source,
            canvas,
            rect: RectState {
                x: 0,
                y: 0,
                size: DEFAULT_BOX_SIZE,
            },
            patch_index: 0,
        }
    }

    /// Advance the session state by one input event. Pure with respect to the
    /// filesystem; a returned effect asks the caller to persist a patch.
    fn apply(&mut self, event: Event) -> Option<Effect> {
        match event {
            Event::PointerMove { x, y } => {
                self.rect.x = x;
                self.rect.y = y;
                None
            }
            Event::ButtonRelease {
                button: LabelButton::Primary,
                ctrl: false,
            } => Some(Effect::CommitPatch(Label::Present)),
            Event::ButtonRelease {
                button: LabelButton::Primary,
                ctrl: true,
            } => None,
            Event::ButtonRelease {
                button: LabelButton::Secondary,
                ..
            } => Some(Effect::CommitPatch(Label::Absent)),
            Event::WheelScroll(WheelDirection::Up) => {
                let max = self.width.min(self.height).saturating_sub(BOX_SIZE_STEP);
                if self.rect.size < max {
                    self.rect.size += BOX_SIZE_STEP;
                }
                None
            }
            Event::WheelScroll(WheelDirection::Down) => {
                if self.rect.size > BOX_SIZE_STEP * 2 {
                    self.rect.size -= BOX_SIZE_STEP;
                }
                None
            }
        }
    }

    /// Intersection of the selection square with the image, as
    /// `(x, y, width, height)`. None when the selection lies fully outside.
    fn crop_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.rect.x.max(0);
        let y0 = self.rect.y.max(0);
        let x1 = (self.rect.x + self.rect.size as i32).min(self.width as i32);
        let y1 = (self.rect.y + self.rect.size as i32).min(self.height as i32);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    fn patch_filename(&self, label: Label) -> String {
        format!(
            "{}_{}_patch{}.{}",
            label.flag(),
            self.stem,
            self.patch_index,
            PATCH_EXT
        )
    }

    /// Record a committed selection on the display canvas.
    fn stamp_rect(&mut self, label: Label) {
        let RectState { x, y, size } = self.rect;
        draw_rect_outline(&mut self.canvas, x, y, size as i32, label.color());
    }
}

fn draw_rect_outline(img: &mut RgbaImage, x: i32, y: i32, size: i32, color: [u8; 4]) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let (x1, y1) = (x + size, y + size);
    let mut put = |px: i32, py: i32| {
        if px >= 0 && px < w && py >= 0 && py < h {
            img.put_pixel(px as u32, py as u32, image::Rgba(color));
        }
    };
    for px in x..=x1 {
        put(px, y);
        put(px, y1);
    }
    for py in y..=y1 {
        put(x, py);
        put(x1, py);
    }
}

// ── Run Context ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
enum PatchError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Resolved output paths for one program run, shared by every session.
struct RunContext {
    run_dir: PathBuf,
    manifest_path: PathBuf,
}

/// Create the timestamp-named output directory for this run. A numeric
/// suffix is appended when two runs start within the same second, so a prior
/// run's manifest is never reused.
fn initialize_run(output_root: &Path) -> io::Result<RunContext> {
    fs::create_dir_all(output_root)?;
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let mut run_dir = output_root.join(&stamp);
    let mut suffix = 1;
    while run_dir.exists() {
        suffix += 1;
        run_dir = output_root.join(format!("{stamp}_{suffix}"));
    }
    fs::create_dir(&run_dir)?;
    Ok(RunContext {
        manifest_path: run_dir.join(MANIFEST_FILE),
        run_dir,
    })
}

impl RunContext {
    fn append_manifest(&self, filename: &str, label: Label) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.manifest_path)?;
        writeln!(file, "{} {}", filename, label.flag())
    }
}

/// Flat listing of the input directory: every regular file counts as an
/// image, in native directory order.
fn scan_input_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

fn load_session(path: &Path) -> Result<Session, PatchError> {
    let source = image::open(path)?.to_rgba8();
    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    Ok(Session::new(stem, source))
}

// ── App ─────────────────────────────────────────────────────────────────────

struct PatchApp {
    run: RunContext,
    queue: Vec<PathBuf>,
    session: Option<Session>,
    texture: Option<egui::TextureHandle>,
    texture_dirty: bool,
}

impl PatchApp {
    fn new(run: RunContext, queue: Vec<PathBuf>) -> Self {
        Self {
            run,
            queue,
            session: None,
            texture: None,
            texture_dirty: false,
        }
    }

    fn ensure_texture(&mut self, ctx: &egui::Context) {
        if self.texture_dirty {
            self.texture = None;
            self.texture_dirty = false;
        }
        if self.texture.is_some() {
            return;
        }
        if let Some(session) = self.session.as_ref() {
            let size = [
                session.canvas.width() as usize,
                session.canvas.height() as usize,
            ];
            let pixels = session.canvas.as_flat_samples();
            let color_image = egui::ColorImage::from_rgba_unmultiplied(size, pixels.as_slice());
            self.texture =
                Some(ctx.load_texture("canvas", color_image, egui::TextureOptions::LINEAR));
        }
    }

    /// Bind a fresh session to the next image in the queue, back-to-front.
    /// Closes the viewport once the queue is exhausted.
    fn advance(&mut self, ctx: &egui::Context) {
        while let Some(path) = self.queue.pop() {
            match load_session(&path) {
                Ok(session) => {
                    log::info!(
                        "labeling {} ({} left in queue)",
                        path.display(),
                        self.queue.len()
                    );
                    self.session = Some(session);
                    self.texture = None;
                    return;
                }
                Err(err) => log::error!("skipping {}: {err}", path.display()),
            }
        }
        self.session = None;
        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
    }

    /// Persist the current selection as a labeled patch: stamp the canvas,
    /// crop the pristine source, resize, write the file, append the manifest
    /// line, and bump the counter. Filename and manifest share one index.
    fn commit_patch(&mut self, label: Label) -> Result<(), PatchError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some((x, y, w, h)) = session.crop_bounds() else {
            log::warn!(
                "selection at ({}, {}) lies outside the image, nothing saved",
                session.rect.x,
                session.rect.y
            );
            return Ok(());
        };
        session.stamp_rect(label);
        let crop = image::imageops::crop_imm(&session.source, x, y, w, h).to_image();
        let patch = image::imageops::resize(&crop, PATCH_SIZE, PATCH_SIZE, FilterType::Triangle);
        let filename = session.patch_filename(label);
        let path = self.run.run_dir.join(&filename);
        // JPEG output; the encoder takes RGB, not RGBA.
        DynamicImage::ImageRgba8(patch).into_rgb8().save(&path)?;
        self.run.append_manifest(&filename, label)?;
        session.patch_index += 1;
        self.texture_dirty = true;
        log::info!("saved {}", path.display());
        Ok(())
    }
}

// ── eframe App impl ─────────────────────────────────────────────────────────

impl eframe::App for PatchApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if self.session.is_none() {
            self.advance(ctx);
        }

        let (advance_pressed, quit_pressed) = ctx.input(|i| {
            (
                i.key_pressed(egui::Key::Space),
                i.key_pressed(egui::Key::Escape),
            )
        });
        if quit_pressed {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            return;
        }
        if advance_pressed {
            self.advance(ctx);
        }

        self.ensure_texture(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            let (response, painter) =
                ui.allocate_painter(ui.available_size(), egui::Sense::click());
            let canvas_rect = response.rect;

            painter.rect_filled(canvas_rect, 0.0, egui::Color32::from_gray(40));

            let Some(tex) = self.texture.as_ref() else {
                return;
            };

            // Fit the image into the panel, centered, uniform scale.
            let tex_size = tex.size_vec2();
            let zoom = (canvas_rect.width() / tex_size.x).min(canvas_rect.height() / tex_size.y);
            let image_rect = egui::Rect::from_center_size(canvas_rect.center(), tex_size * zoom);
            painter.image(
                tex.id(),
                image_rect,
                egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                egui::Color32::WHITE,
            );

            // Translate raw input into session events. The pointer position is
            // mapped into source-image pixels and applied first, so commits cut
            // at the position of the click.
            let mut events = Vec::new();
            if let Some(pos) = response.hover_pos() {
                let x = ((pos.x - image_rect.min.x) / zoom).floor() as i32;
                let y = ((pos.y - image_rect.min.y) / zoom).floor() as i32;
                events.push(Event::PointerMove { x, y });
            }
            let ctrl = ctx.input(|i| i.modifiers.ctrl);
            if response.clicked() {
                events.push(Event::ButtonRelease {
                    button: LabelButton::Primary,
                    ctrl,
                });
            }
            if response.secondary_clicked() {
                events.push(Event::ButtonRelease {
                    button: LabelButton::Secondary,
                    ctrl,
                });
            }
            if response.hovered() {
                let scroll = ctx.input(|i| i.raw_scroll_delta.y);
                if scroll > 0.0 {
                    events.push(Event::WheelScroll(WheelDirection::Up));
                } else if scroll < 0.0 {
                    events.push(Event::WheelScroll(WheelDirection::Down));
                }
            }

            let mut effects = Vec::new();
            if let Some(session) = self.session.as_mut() {
                for event in events {
                    if let Some(effect) = session.apply(event) {
                        effects.push(effect);
                    }
                }
            }
            for Effect::CommitPatch(label) in effects {
                if let Err(err) = self.commit_patch(label) {
                    log::error!("failed to save patch: {err}");
                }
            }

            // Live selection overlay: black outline with a white inline.
            if let Some(session) = self.session.as_ref() {
                let rect = session.rect;
                let min = image_rect.min + egui::vec2(rect.x as f32, rect.y as f32) * zoom;
                let overlay =
                    egui::Rect::from_min_size(min, egui::Vec2::splat(rect.size as f32 * zoom));
                painter.rect_stroke(
                    overlay,
                    0.0,
                    egui::Stroke::new(1.0, egui::Color32::BLACK),
                    egui::StrokeKind::Middle,
                );
                painter.rect_stroke(
                    overlay.shrink(zoom),
                    0.0,
                    egui::Stroke::new(1.0, egui::Color32::WHITE),
                    egui::StrokeKind::Middle,
                );
            }
        });
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() -> eframe::Result<()> {
    env_logger::init();

    let input_dir = Path::new(INPUT_DIR);
    if !input_dir.is_dir() {
        eprintln!("Input directory not found: {}", input_dir.display());
        std::process::exit(1);
    }
    let images = match scan_input_dir(input_dir) {
        Ok(images) => images,
        Err(err) => {
            eprintln!("Failed to list {}: {err}", input_dir.display());
            std::process::exit(1);
        }
    };
    if images.is_empty() {
        eprintln!("No images in {}", input_dir.display());
        return Ok(());
    }

    let run = match initialize_run(Path::new(OUTPUT_DIR)) {
        Ok(run) => run,
        Err(err) => {
            eprintln!("Failed to create output directory: {err}");
            std::process::exit(1);
        }
    };
    log::info!(
        "{} images queued, writing patches to {}",
        images.len(),
        run.run_dir.display()
    );

    let title = format!(
        "patch-label {}x{} {}/*.{}",
        PATCH_SIZE,
        PATCH_SIZE,
        run.run_dir.display(),
        PATCH_EXT
    );

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_title(&title)
            .with_fullscreen(FULLSCREEN),
        ..Default::default()
    };

    eframe::run_native(
        &title,
        options,
        Box::new(move |_cc| Ok(Box::new(PatchApp::new(run, images)))),
    )
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BG: [u8; 4] = [10, 20, 30, 255];

    fn blank_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba(BG))
    }

    fn session(width: u32, height: u32) -> Session {
        Session::new("frame".to_string(), blank_image(width, height))
    }

    #[test]
    fn wheel_scroll_moves_in_fixed_steps() {
        let mut s = session(500, 500);
        for _ in 0..5 {
            s.apply(Event::WheelScroll(WheelDirection::Up));
        }
        assert_eq!(s.rect.size, DEFAULT_BOX_SIZE + 5 * BOX_SIZE_STEP);
        s.apply(Event::WheelScroll(WheelDirection::Down));
        assert_eq!(s.rect.size, DEFAULT_BOX_SIZE + 4 * BOX_SIZE_STEP);
    }

    #[test]
    fn wheel_scroll_saturates_at_bounds() {
        let mut s = session(500, 400);
        for _ in 0..500 {
            s.apply(Event::WheelScroll(WheelDirection::Up));
            assert!(s.rect.size <= 400 - BOX_SIZE_STEP);
        }
        assert_eq!(s.rect.size, 400 - BOX_SIZE_STEP);
        for _ in 0..500 {
            s.apply(Event::WheelScroll(WheelDirection::Down));
            assert!(s.rect.size >= 2 * BOX_SIZE_STEP);
        }
        assert_eq!(s.rect.size, 2 * BOX_SIZE_STEP);
    }

    #[test]
    fn pointer_move_tracks_position_exactly() {
        let mut s = session(500, 500);
        assert_eq!(s.apply(Event::PointerMove { x: 200, y: 150 }), None);
        assert_eq!((s.rect.x, s.rect.y), (200, 150));
        s.apply(Event::PointerMove { x: -12, y: 640 });
        assert_eq!((s.rect.x, s.rect.y), (-12, 640));
    }

    #[test]
    fn button_release_maps_to_labels() {
        let mut s = session(500, 500);
        assert_eq!(
            s.apply(Event::ButtonRelease {
                button: LabelButton::Primary,
                ctrl: false,
            }),
            Some(Effect::CommitPatch(Label::Present))
        );
        assert_eq!(
            s.apply(Event::ButtonRelease {
                button: LabelButton::Primary,
                ctrl: true,
            }),
            None
        );
        assert_eq!(
            s.apply(Event::ButtonRelease {
                button: LabelButton::Secondary,
                ctrl: false,
            }),
            Some(Effect::CommitPatch(Label::Absent))
        );
    }

    #[test]
    fn crop_bounds_clip_to_image() {
        let mut s = session(500, 500);
        s.apply(Event::PointerMove { x: 450, y: 470 });
        assert_eq!(s.crop_bounds(), Some((450, 470, 50, 30)));
        s.apply(Event::PointerMove { x: -20, y: -40 });
        assert_eq!(s.crop_bounds(), Some((0, 0, 80, 60)));
        s.apply(Event::PointerMove { x: 600, y: 0 });
        assert_eq!(s.crop_bounds(), None);
    }

    #[test]
    fn stamp_keeps_source_pristine() {
        let mut s = session(64, 64);
        s.apply(Event::PointerMove { x: 8, y: 8 });
        let before = s.source.clone();
        s.stamp_rect(Label::Present);
        assert_eq!(s.source, before);
        assert_eq!(s.canvas.get_pixel(8, 8), &image::Rgba(PRESENT_COLOR));
        assert_eq!(s.canvas.get_pixel(30, 30), &image::Rgba(BG));
    }

    #[test]
    fn rect_outline_clips_offscreen_edges() {
        let mut img = blank_image(8, 8);
        draw_rect_outline(&mut img, -5, -5, 10, [1, 2, 3, 255]);
        assert_eq!(img.get_pixel(5, 0), &image::Rgba([1, 2, 3, 255]));
        assert_eq!(img.get_pixel(0, 5), &image::Rgba([1, 2, 3, 255]));
        assert_eq!(img.get_pixel(0, 0), &image::Rgba(BG));
    }

    #[test]
    fn patch_filenames_embed_label_stem_and_index() {
        let mut s = session(64, 64);
        assert_eq!(s.patch_filename(Label::Present), "1_frame_patch0.jpg");
        s.patch_index += 1;
        assert_eq!(s.patch_filename(Label::Absent), "0_frame_patch1.jpg");
    }

    #[test]
    fn commit_writes_patch_and_manifest_with_matching_indices() {
        let dir = tempdir().unwrap();
        let run = initialize_run(dir.path()).unwrap();
        let mut app = PatchApp::new(run, Vec::new());
        app.session = Some(session(64, 64));
        app.session
            .as_mut()
            .unwrap()
            .apply(Event::PointerMove { x: 4, y: 4 });

        app.commit_patch(Label::Present).unwrap();
        app.commit_patch(Label::Absent).unwrap();

        let first = app.run.run_dir.join("1_frame_patch0.jpg");
        let second = app.run.run_dir.join("0_frame_patch1.jpg");
        assert!(first.is_file());
        assert!(second.is_file());

        let manifest = fs::read_to_string(&app.run.manifest_path).unwrap();
        assert_eq!(manifest, "1_frame_patch0.jpg 1\n0_frame_patch1.jpg 0\n");

        let patch = image::open(&first).unwrap();
        assert_eq!((patch.width(), patch.height()), (PATCH_SIZE, PATCH_SIZE));
    }

    #[test]
    fn offscreen_selection_commits_nothing() {
        let dir = tempdir().unwrap();
        let run = initialize_run(dir.path()).unwrap();
        let mut app = PatchApp::new(run, Vec::new());
        app.session = Some(session(64, 64));
        app.session
            .as_mut()
            .unwrap()
            .apply(Event::PointerMove { x: 200, y: 200 });

        app.commit_patch(Label::Present).unwrap();

        assert_eq!(app.session.as_ref().unwrap().patch_index, 0);
        assert!(!app.run.manifest_path.exists());
        assert_eq!(fs::read_dir(&app.run.run_dir).unwrap().count(), 0);
    }

    #[test]
    fn each_run_gets_its_own_output_directory() {
        let root = tempdir().unwrap();
        let first = initialize_run(root.path()).unwrap();
        let second = initialize_run(root.path()).unwrap();
        assert_ne!(first.run_dir, second.run_dir);
        assert!(first.run_dir.is_dir());
        assert!(second.run_dir.is_dir());
        assert_ne!(first.manifest_path, second.manifest_path);
    }

    #[test]
    fn scan_lists_files_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let files = scan_input_dir(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.is_file()));
    }
}
