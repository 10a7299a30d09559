use anyhow::{Result, bail};
use image::Rgb;

const DEFAULT_COLORS: [[u8; 3]; 12] = [
    [0, 0, 255],
    [0, 255, 0],
    [255, 0, 0],
    [0, 255, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 0, 128],
    [0, 128, 0],
    [128, 0, 0],
    [0, 128, 128],
    [128, 128, 0],
    [128, 0, 128],
];

/// Fixed colour table indexed modulo its size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<Rgb<u8>>,
}

impl Palette {
    pub fn new(colors: impl IntoIterator<Item = [u8; 3]>) -> Result<Self> {
        let colors: Vec<Rgb<u8>> = colors.into_iter().map(Rgb).collect();
        if colors.is_empty() {
            bail!("palette needs at least one colour");
        }
        Ok(Self { colors })
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    /// Colour for a 0-based index-map label.
    pub fn for_label(&self, label: u32) -> Rgb<u8> {
        self.colors[label as usize % self.colors.len()]
    }

    /// Colour for a 1-based skeleton id.
    pub fn for_body_id(&self, id: u32) -> Rgb<u8> {
        self.colors[id.saturating_sub(1) as usize % self.colors.len()]
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: DEFAULT_COLORS.iter().copied().map(Rgb).collect(),
        }
    }
}
