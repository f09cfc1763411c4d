use std::io::Cursor;
use std::sync::Arc;

use serde::Deserialize;

use crate::asset::{Asset, AssetState, LoadProgress};
use crate::asset_key::{AssetId, AssetName};
use crate::asset_manager::AssetManager;
use crate::asset_source::AssetSource;
use crate::logging;

/// Decoded RGBA8 pixels.
#[derive(Clone, Debug)]
pub struct ImageAsset {
    width: u32,
    height: u32,
    rgba: Arc<Vec<u8>>,
}

impl ImageAsset {
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, String> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(format!(
                "rgba buffer is {} bytes, expected {} for {}x{}",
                rgba.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            width,
            height,
            rgba: Arc::new(rgba),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &Arc<Vec<u8>> {
        &self.rgba
    }
}

impl Asset for ImageAsset {}

pub fn decode_png(bytes: &[u8]) -> Result<ImageAsset, String> {
    let decoder = png::Decoder::new(Cursor::new(bytes));
    let mut reader = decoder.read_info().map_err(|err| err.to_string())?;
    if reader.info().bit_depth != png::BitDepth::Eight {
        return Err("png bit depth must be 8".to_string());
    }
    let mut buf = vec![0; reader.output_buffer_size()];
    let output = reader.next_frame(&mut buf).map_err(|err| err.to_string())?;
    let pixels = &buf[..output.buffer_size()];
    let texels = output.width as usize * output.height as usize;
    let rgba = match output.color_type {
        png::ColorType::Rgba => pixels.to_vec(),
        png::ColorType::Rgb => {
            let mut out = Vec::with_capacity(texels * 4);
            for chunk in pixels.chunks_exact(3) {
                out.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            out
        }
        png::ColorType::Grayscale => {
            let mut out = Vec::with_capacity(texels * 4);
            for value in pixels {
                out.extend_from_slice(&[*value, *value, *value, 255]);
            }
            out
        }
        png::ColorType::GrayscaleAlpha => {
            let mut out = Vec::with_capacity(texels * 4);
            for chunk in pixels.chunks_exact(2) {
                out.extend_from_slice(&[chunk[0], chunk[0], chunk[0], chunk[1]]);
            }
            out
        }
        other => return Err(format!("unsupported png color type {:?}", other)),
    };
    ImageAsset::from_rgba(output.width, output.height, rgba)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFilter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TextureDescriptor {
    pub image: String,
    #[serde(default)]
    pub filter: TextureFilter,
}

/// What the main thread hands to the renderer for one texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureUpload {
    pub width: u32,
    pub height: u32,
    pub filter: TextureFilter,
    pub rgba: Arc<Vec<u8>>,
}

/// A texture built from an image asset. The upload happens during
/// completion, after which the image reference is dropped.
pub struct TextureAsset {
    image_name: AssetName,
    filter: TextureFilter,
    image: AssetId,
    upload: Option<TextureUpload>,
}

impl TextureAsset {
    pub fn from_descriptor(name: &AssetName, text: &str) -> Result<Self, String> {
        let descriptor: TextureDescriptor =
            toml::from_str(text).map_err(|err| err.to_string())?;
        let image_name = name
            .sibling(&descriptor.image)
            .map_err(|err| format!("image: {}", err))?;
        Ok(Self {
            image_name,
            filter: descriptor.filter,
            image: AssetId::INVALID,
            upload: None,
        })
    }

    pub fn image_name(&self) -> &AssetName {
        &self.image_name
    }

    pub fn filter(&self) -> TextureFilter {
        self.filter
    }

    pub fn upload(&self) -> Option<&TextureUpload> {
        self.upload.as_ref()
    }

    fn finish_upload(&mut self, assets: &mut AssetManager) -> LoadProgress {
        let pixels = assets
            .get::<ImageAsset>(self.image)
            .map(|image| (image.width(), image.height(), Arc::clone(image.rgba())));
        let Some((width, height, rgba)) = pixels else {
            return LoadProgress::Failed;
        };
        self.upload = Some(TextureUpload {
            width,
            height,
            filter: self.filter,
            rgba,
        });
        assets.release(self.image);
        self.image = AssetId::INVALID;
        LoadProgress::Ready
    }
}

impl Asset for TextureAsset {
    fn complete_async_load(&mut self, assets: &mut AssetManager) -> LoadProgress {
        if !self.image.is_valid() {
            self.image = assets.request::<ImageAsset>(self.image_name.as_str());
            if !self.image.is_valid() {
                return LoadProgress::Failed;
            }
        }
        match assets.asset_state(self.image) {
            AssetState::Future => LoadProgress::Pending,
            AssetState::Loaded => self.finish_upload(assets),
            AssetState::Unregistered => LoadProgress::Failed,
        }
    }

    fn complete_sync_load(&mut self, assets: &mut AssetManager) -> LoadProgress {
        self.image = assets.load_synchronous::<ImageAsset>(self.image_name.as_str());
        if !self.image.is_valid() {
            return LoadProgress::Failed;
        }
        self.finish_upload(assets)
    }

    fn release_resources(&mut self, assets: &mut AssetManager) {
        if self.image.is_valid() {
            assets.release(self.image);
            self.image = AssetId::INVALID;
        }
        if let Some(upload) = self.upload.take() {
            logging::debug(format!(
                "released {}x{} texture",
                upload.width, upload.height
            ));
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpriteSheetDescriptor {
    pub texture: String,
    pub columns: u32,
    pub rows: u32,
    #[serde(default)]
    pub padding: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpriteFrame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Uniform grid of frames cut from a texture. Holds its texture for as long
/// as it is loaded.
pub struct GridSpriteSheet {
    texture_name: AssetName,
    columns: u32,
    rows: u32,
    padding: u32,
    texture: AssetId,
    frames: Vec<SpriteFrame>,
}

impl GridSpriteSheet {
    pub fn from_descriptor(name: &AssetName, text: &str) -> Result<Self, String> {
        let descriptor: SpriteSheetDescriptor =
            toml::from_str(text).map_err(|err| err.to_string())?;
        if descriptor.columns == 0 || descriptor.rows == 0 {
            return Err("sprite sheet needs at least one column and row".to_string());
        }
        let texture_name = name
            .sibling(&descriptor.texture)
            .map_err(|err| format!("texture: {}", err))?;
        Ok(Self {
            texture_name,
            columns: descriptor.columns,
            rows: descriptor.rows,
            padding: descriptor.padding,
            texture: AssetId::INVALID,
            frames: Vec::new(),
        })
    }

    pub fn texture(&self) -> AssetId {
        self.texture
    }

    pub fn texture_name(&self) -> &AssetName {
        &self.texture_name
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn frames(&self) -> &[SpriteFrame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<SpriteFrame> {
        self.frames.get(index).copied()
    }

    fn cut_frames(&mut self, assets: &mut AssetManager) -> LoadProgress {
        let size = assets
            .get::<TextureAsset>(self.texture)
            .and_then(|texture| texture.upload())
            .map(|upload| (upload.width, upload.height));
        let Some((width, height)) = size else {
            return LoadProgress::Failed;
        };
        let cells = grid_cell_size(width, self.columns, self.padding)
            .zip(grid_cell_size(height, self.rows, self.padding));
        let Some((cell_width, cell_height)) = cells else {
            logging::warn(format!(
                "{}x{} texture '{}' cannot hold a {}x{} grid with padding {}",
                width, height, self.texture_name, self.columns, self.rows, self.padding
            ));
            return LoadProgress::Failed;
        };
        // Every cell and gutter fits inside the texture, so offsets cannot
        // overflow. Padding after the last cell is never added.
        self.frames.clear();
        for row in 0..self.rows {
            for column in 0..self.columns {
                self.frames.push(SpriteFrame {
                    x: column * cell_width + column * self.padding,
                    y: row * cell_height + row * self.padding,
                    width: cell_width,
                    height: cell_height,
                });
            }
        }
        LoadProgress::Ready
    }
}

impl Asset for GridSpriteSheet {
    fn complete_async_load(&mut self, assets: &mut AssetManager) -> LoadProgress {
        if !self.texture.is_valid() {
            self.texture = assets.request::<TextureAsset>(self.texture_name.as_str());
            if !self.texture.is_valid() {
                return LoadProgress::Failed;
            }
        }
        match assets.asset_state(self.texture) {
            AssetState::Future => LoadProgress::Pending,
            AssetState::Loaded => self.cut_frames(assets),
            AssetState::Unregistered => LoadProgress::Failed,
        }
    }

    fn complete_sync_load(&mut self, assets: &mut AssetManager) -> LoadProgress {
        self.texture = assets.load_synchronous::<TextureAsset>(self.texture_name.as_str());
        if !self.texture.is_valid() {
            return LoadProgress::Failed;
        }
        self.cut_frames(assets)
    }

    fn release_resources(&mut self, assets: &mut AssetManager) {
        if self.texture.is_valid() {
            assets.release(self.texture);
            self.texture = AssetId::INVALID;
        }
        self.frames.clear();
    }
}

// Size of one cell when `count` cells separated by `padding` share `extent`
// pixels; None when not even one pixel per cell fits.
fn grid_cell_size(extent: u32, count: u32, padding: u32) -> Option<u32> {
    let gutters = padding.checked_mul(count.checked_sub(1)?)?;
    let cell = extent.checked_sub(gutters)? / count;
    (cell > 0).then_some(cell)
}

/// Registers loaders for [`ImageAsset`], [`TextureAsset`] and
/// [`GridSpriteSheet`] reading from `source`.
pub fn register_builtin_loaders(assets: &mut AssetManager, source: Arc<dyn AssetSource>) {
    let images = Arc::clone(&source);
    assets.register_loader(move |name: &AssetName| {
        read_and_decode(images.as_ref(), name, |bytes| decode_png(&bytes))
    });
    let textures = Arc::clone(&source);
    assets.register_loader(move |name: &AssetName| {
        read_and_decode(textures.as_ref(), name, |bytes| {
            TextureAsset::from_descriptor(name, &descriptor_text(bytes)?)
        })
    });
    assets.register_loader(move |name: &AssetName| {
        read_and_decode(source.as_ref(), name, |bytes| {
            GridSpriteSheet::from_descriptor(name, &descriptor_text(bytes)?)
        })
    });
}

fn read_and_decode<T>(
    source: &dyn AssetSource,
    name: &AssetName,
    decode: impl FnOnce(Vec<u8>) -> Result<T, String>,
) -> Option<T> {
    let bytes = match source.read(name) {
        Ok(bytes) => bytes,
        Err(err) => {
            logging::warn(format!("read '{}': {}", name, err));
            return None;
        }
    };
    match decode(bytes) {
        Ok(asset) => Some(asset),
        Err(err) => {
            logging::warn(format!("decode '{}': {}", name, err));
            None
        }
    }
}

fn descriptor_text(bytes: Vec<u8>) -> Result<String, String> {
    String::from_utf8(bytes).map_err(|err| format!("descriptor is not utf-8: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_manager::{AssetError, AssetManagerConfig};
    use crate::asset_source::MemorySource;
    use crate::jobs::{JobSystem, JobsConfig};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn png_bytes(width: u32, height: u32, color: png::ColorType) -> Vec<u8> {
        let channels = match color {
            png::ColorType::Rgb => 3,
            png::ColorType::Grayscale => 1,
            _ => 4,
        };
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(color);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            let data = vec![200u8; (width * height * channels) as usize];
            writer.write_image_data(&data).unwrap();
        }
        out
    }

    fn hero_source() -> Arc<MemorySource> {
        Arc::new(
            MemorySource::new()
                .with_file(
                    "sprites/hero.sheet",
                    "texture = \"hero.texture\"\ncolumns = 4\nrows = 2\n",
                )
                .with_file(
                    "sprites/hero.texture",
                    "image = \"hero.png\"\nfilter = \"linear\"\n",
                )
                .with_file("sprites/hero.png", png_bytes(64, 32, png::ColorType::Rgba)),
        )
    }

    fn manager(config: JobsConfig, source: Arc<MemorySource>) -> AssetManager {
        let jobs = Arc::new(JobSystem::new(config).unwrap());
        let mut assets = AssetManager::new(jobs, AssetManagerConfig::default());
        register_builtin_loaders(&mut assets, source);
        assets
    }

    fn assert_hero_sheet(assets: &mut AssetManager, id: AssetId) {
        let (texture, frame_count, frame) = {
            let sheet = assets.get::<GridSpriteSheet>(id).expect("sheet loaded");
            (sheet.texture(), sheet.frames().len(), sheet.frame(5))
        };
        assert_eq!(frame_count, 8);
        assert_eq!(
            frame,
            Some(SpriteFrame {
                x: 16,
                y: 16,
                width: 16,
                height: 16,
            })
        );
        assert_eq!(assets.ref_count(texture), 1);
        let upload = assets
            .get::<TextureAsset>(texture)
            .and_then(|texture| texture.upload())
            .cloned()
            .expect("texture uploaded");
        assert_eq!((upload.width, upload.height), (64, 32));
        assert_eq!(upload.filter, TextureFilter::Linear);
        // The texture dropped its image once the upload was done.
        assert_eq!(assets.id_for::<ImageAsset>("sprites/hero.png"), None);
    }

    #[test]
    fn decode_png_expands_to_rgba() {
        let image = decode_png(&png_bytes(2, 1, png::ColorType::Rgb)).unwrap();
        assert_eq!((image.width(), image.height()), (2, 1));
        assert_eq!(image.rgba().as_slice(), &[200, 200, 200, 255, 200, 200, 200, 255]);

        let gray = decode_png(&png_bytes(1, 1, png::ColorType::Grayscale)).unwrap();
        assert_eq!(gray.rgba().as_slice(), &[200, 200, 200, 255]);

        assert!(decode_png(b"not a png").is_err());
    }

    #[test]
    fn descriptors_reject_bad_input() {
        let name = AssetName::new("sprites/a.sheet").unwrap();
        assert!(GridSpriteSheet::from_descriptor(&name, "texture = \"a\"\ncolumns = 0\nrows = 1")
            .is_err());
        assert!(GridSpriteSheet::from_descriptor(&name, "columns = 1").is_err());
        assert!(TextureAsset::from_descriptor(&name, "image = \"../up.png\"").is_err());
    }

    #[test]
    fn sprite_sheet_waits_for_nested_chain() {
        let mut assets = manager(JobsConfig::inline(), hero_source());
        let id = assets.request::<GridSpriteSheet>("sprites/hero.sheet");
        assert!(id.is_valid());

        let mut frames = 0;
        while assets.asset_state(id) == AssetState::Future {
            assets.begin_frame();
            frames += 1;
            assert!(frames < 16, "sprite sheet never finished");
        }
        // Sheet, texture and image each take a frame to start and the two
        // outer assets one more to see their dependency finish.
        assert_eq!(frames, 5);
        assert_eq!(assets.telemetry().loads_completed, 3);
        assert_eq!(assets.telemetry().loads_posted, 3);
        assert_hero_sheet(&mut assets, id);

        assets.release(id);
        assert_eq!(assets.loaded_count(), 0);
        assert_eq!(assets.id_for::<TextureAsset>("sprites/hero.texture"), None);
    }

    // Records what every completion poll of the wrapped sheet returned and
    // the texture state at that moment.
    struct RecordingSheet {
        inner: GridSpriteSheet,
        polls: Arc<Mutex<Vec<(LoadProgress, AssetState)>>>,
    }

    impl Asset for RecordingSheet {
        fn complete_async_load(&mut self, assets: &mut AssetManager) -> LoadProgress {
            let result = self.inner.complete_async_load(assets);
            let texture = assets.asset_state(self.inner.texture());
            self.polls.lock().unwrap().push((result, texture));
            result
        }

        fn release_resources(&mut self, assets: &mut AssetManager) {
            self.inner.release_resources(assets);
        }
    }

    #[test]
    fn sprite_sheet_polls_pending_until_texture_then_ready_once() {
        let source = hero_source();
        let mut assets = manager(JobsConfig::inline(), Arc::clone(&source));
        let polls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&polls);
        assets.register_loader(move |name: &AssetName| {
            read_and_decode(source.as_ref(), name, |bytes| {
                let inner = GridSpriteSheet::from_descriptor(name, &descriptor_text(bytes)?)?;
                Ok(RecordingSheet {
                    inner,
                    polls: Arc::clone(&recorded),
                })
            })
        });

        let id = assets.request::<RecordingSheet>("sprites/hero.sheet");
        let mut frames = 0;
        while assets.asset_state(id) == AssetState::Future {
            assets.begin_frame();
            frames += 1;
            assert!(frames < 16, "sprite sheet never finished");
        }
        assert_eq!(assets.asset_state(id), AssetState::Loaded);

        let seen = polls.lock().unwrap().clone();
        let (last, earlier) = seen.split_last().expect("sheet was polled");
        assert_eq!(*last, (LoadProgress::Ready, AssetState::Loaded));
        assert!(!earlier.is_empty(), "sheet never had to wait for its texture");
        for (result, texture) in earlier {
            assert_eq!(*result, LoadProgress::Pending);
            assert_ne!(*texture, AssetState::Loaded);
        }

        for _ in 0..4 {
            assets.begin_frame();
        }
        assert_eq!(polls.lock().unwrap().len(), seen.len());
        assert_eq!(
            assets.get::<RecordingSheet>(id).map(|sheet| sheet.inner.frames().len()),
            Some(8)
        );
        assets.release(id);
        assert_eq!(assets.loaded_count(), 0);
    }

    #[test]
    fn oversized_padding_fails_the_sheet() {
        let source = Arc::new(
            MemorySource::new()
                .with_file(
                    "sprites/wide.sheet",
                    "texture = \"a.texture\"\ncolumns = 3\nrows = 1\npadding = 3000000000\n",
                )
                .with_file(
                    "sprites/single.sheet",
                    "texture = \"a.texture\"\ncolumns = 1\nrows = 1\npadding = 4000000000\n",
                )
                .with_file("sprites/a.texture", "image = \"a.png\"\n")
                .with_file("sprites/a.png", png_bytes(8, 8, png::ColorType::Rgba)),
        );
        let mut assets = manager(JobsConfig::inline(), source);
        let wide = assets.request::<GridSpriteSheet>("sprites/wide.sheet");
        let single = assets.request::<GridSpriteSheet>("sprites/single.sheet");
        for _ in 0..8 {
            assets.begin_frame();
        }

        assert_eq!(assets.asset_state(wide), AssetState::Unregistered);
        assert!(matches!(
            assets.last_error(),
            Some(AssetError::FailedToLoad { .. })
        ));
        // Padding only sits between cells, so a single cell ignores it.
        assert_eq!(
            assets.get::<GridSpriteSheet>(single).map(|sheet| sheet.frames().to_vec()),
            Some(vec![SpriteFrame {
                x: 0,
                y: 0,
                width: 8,
                height: 8,
            }])
        );
        assert_eq!(grid_cell_size(64, 4, 0), Some(16));
        assert_eq!(grid_cell_size(10, 3, 2), Some(2));
        assert_eq!(grid_cell_size(4, 3, 2), None);
        assert_eq!(grid_cell_size(8, 3, u32::MAX), None);
    }

    #[test]
    fn sprite_sheet_loads_on_worker_threads() {
        let mut assets = manager(JobsConfig::threaded(1, 2), hero_source());
        let id = assets.request::<GridSpriteSheet>("sprites/hero.sheet");
        let deadline = Instant::now() + Duration::from_secs(5);
        while assets.asset_state(id) == AssetState::Future {
            assert!(Instant::now() < deadline, "sprite sheet never finished");
            assets.begin_frame();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_hero_sheet(&mut assets, id);
    }

    #[test]
    fn sprite_sheet_loads_synchronously() {
        let mut assets = manager(JobsConfig::inline(), hero_source());
        let id = assets.load_synchronous::<GridSpriteSheet>("sprites/hero.sheet");
        assert_eq!(assets.asset_state(id), AssetState::Loaded);
        assert_eq!(assets.future_count(), 0);
        assert_hero_sheet(&mut assets, id);
    }

    #[test]
    fn missing_texture_fails_the_sheet() {
        let source = Arc::new(MemorySource::new().with_file(
            "sprites/broken.sheet",
            "texture = \"nowhere.texture\"\ncolumns = 2\nrows = 2\n",
        ));
        let mut assets = manager(JobsConfig::inline(), source);
        let id = assets.request::<GridSpriteSheet>("sprites/broken.sheet");
        for _ in 0..4 {
            assets.begin_frame();
        }
        assert_eq!(assets.asset_state(id), AssetState::Unregistered);
        assert_eq!(assets.loaded_count(), 0);
        assert_eq!(assets.future_count(), 0);
        assert!(matches!(
            assets.last_error(),
            Some(AssetError::FailedToLoad { .. })
        ));
        assert_eq!(assets.telemetry().failures, 2);
        assets.release(id);
        assert_eq!(assets.ref_count(id), 0);
    }
}
