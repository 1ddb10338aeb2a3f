//! Free-hand drawing canvas. Each completed stroke is saved as a PNG snapshot.

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

use crate::clock::{self, MonotonicStamper};
use crate::config::{DrawingSettings, PanelSettings};
use crate::panel::{Availability, ModalityPanel, PanelStatus};
use crate::sink::{CsvSink, RecordingSink};

pub const DRAWING_INDEX: &str = "drawings.csv";

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

pub struct DrawingPanel {
    canvas: RgbImage,
    pen: Rgb<u8>,
    pen_width: u32,
    last_point: Option<(i64, i64)>,
    stroke_dirty: bool,
    recording: Option<DrawingSession>,
    stamper: MonotonicStamper,
    saved: usize,
}

struct DrawingSession {
    dir: PathBuf,
    index: CsvSink,
}

impl DrawingPanel {
    pub fn new(settings: &DrawingSettings) -> Self {
        Self {
            canvas: RgbImage::from_pixel(settings.width.max(1), settings.height.max(1), BACKGROUND),
            pen: Rgb([0, 0, 0]),
            pen_width: settings.pen_width.max(1),
            last_point: None,
            stroke_dirty: false,
            recording: None,
            stamper: MonotonicStamper::default(),
            saved: 0,
        }
    }

    pub fn canvas(&self) -> &RgbImage {
        &self.canvas
    }

    pub fn set_pen(&mut self, color: [u8; 3], width: u32) {
        self.pen = Rgb(color);
        self.pen_width = width.max(1);
    }

    pub fn clear(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = BACKGROUND;
        }
        self.last_point = None;
        self.stroke_dirty = false;
    }

    pub fn pen_down(&mut self, x: i64, y: i64) {
        self.stamp(x, y);
        self.last_point = Some((x, y));
        self.stroke_dirty = true;
    }

    pub fn pen_move(&mut self, x: i64, y: i64) {
        let Some((x0, y0)) = self.last_point else {
            return;
        };
        let steps = (x - x0).abs().max((y - y0).abs()).max(1);
        for step in 1..=steps {
            let px = x0 + (x - x0) * step / steps;
            let py = y0 + (y - y0) * step / steps;
            self.stamp(px, py);
        }
        self.last_point = Some((x, y));
        self.stroke_dirty = true;
    }

    /// Ends the stroke. While recording, the canvas is written to
    /// `<stamp>.png` and listed in the drawing index; the new file is returned.
    pub fn pen_up(&mut self) -> Result<Option<PathBuf>> {
        self.last_point = None;
        if !std::mem::take(&mut self.stroke_dirty) {
            return Ok(None);
        }
        let Some(session) = self.recording.as_mut() else {
            return Ok(None);
        };
        let at = self.stamper.next();
        let name = format!("{}.png", clock::file_stamp(at));
        let path = session.dir.join(&name);
        self.canvas
            .save(&path)
            .with_context(|| format!("saving drawing {}", path.display()))?;
        session.index.append([clock::iso(at).as_str(), name.as_str()])?;
        self.saved += 1;
        Ok(Some(path))
    }

    // filled disc centred on the point
    fn stamp(&mut self, cx: i64, cy: i64) {
        let radius = i64::from(self.pen_width / 2);
        let (w, h) = (i64::from(self.canvas.width()), i64::from(self.canvas.height()));
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius * radius {
                    continue;
                }
                let (x, y) = (cx + dx, cy + dy);
                if (0..w).contains(&x) && (0..h).contains(&y) {
                    self.canvas.put_pixel(x as u32, y as u32, self.pen);
                }
            }
        }
    }
}

impl ModalityPanel for DrawingPanel {
    fn kind(&self) -> &str {
        "Drawing"
    }

    fn status(&self) -> PanelStatus {
        if self.recording.is_some() {
            PanelStatus::Recording
        } else {
            PanelStatus::Idle
        }
    }

    fn start_recording(&mut self, dir: &Path) -> Result<Availability> {
        if self.recording.is_some() {
            return Ok(Availability::Ready);
        }
        let index = CsvSink::open(&dir.join(DRAWING_INDEX), &["timestamp", "filename"])?;
        self.clear();
        self.saved = 0;
        self.recording = Some(DrawingSession {
            dir: dir.to_path_buf(),
            index,
        });
        Ok(Availability::Ready)
    }

    fn stop_recording(&mut self) -> Result<()> {
        if let Some(mut session) = self.recording.take() {
            session.index.close()?;
        }
        Ok(())
    }

    fn readout(&self) -> Option<String> {
        Some(format!("snapshots: {}", self.saved))
    }
}

pub(crate) fn build(settings: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
    Ok(Box::new(DrawingPanel::new(&settings.drawing)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn panel() -> DrawingPanel {
        DrawingPanel::new(&DrawingSettings {
            width: 40,
            height: 30,
            pen_width: 3,
        })
    }

    #[test]
    fn strokes_paint_between_points() {
        let mut panel = panel();
        panel.pen_down(2, 2);
        panel.pen_move(20, 2);
        assert_eq!(panel.canvas().get_pixel(11, 2), &Rgb([0, 0, 0]));
        assert_eq!(panel.canvas().get_pixel(11, 20), &BACKGROUND);
        assert!(panel.pen_up().unwrap().is_none());
    }

    #[test]
    fn each_stroke_saves_a_snapshot_while_recording() {
        let dir = tempdir().unwrap();
        let mut panel = panel();
        panel.start_recording(dir.path()).unwrap();
        panel.pen_down(1, 1);
        panel.pen_move(10, 10);
        let first = panel.pen_up().unwrap().unwrap();
        panel.pen_down(5, 20);
        let second = panel.pen_up().unwrap().unwrap();
        panel.stop_recording().unwrap();

        assert_ne!(first, second);
        let img = image::open(&second).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (40, 30));
        assert_eq!(img.get_pixel(10, 10), &Rgb([0, 0, 0]));

        let mut reader = csv::Reader::from_path(dir.path().join(DRAWING_INDEX)).unwrap();
        assert_eq!(reader.records().count(), 2);
    }

    #[test]
    fn pen_up_without_stroke_saves_nothing() {
        let dir = tempdir().unwrap();
        let mut panel = panel();
        panel.start_recording(dir.path()).unwrap();
        assert!(panel.pen_up().unwrap().is_none());
        panel.stop_recording().unwrap();
        panel.stop_recording().unwrap();
    }
}
