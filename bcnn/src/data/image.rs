//! Image arrays and file I/O.
//!
//! Samples travel through the data pipeline as channel-first `f32` arrays so
//! that normalization and augmentation work the same for MetaImage volumes
//! (arbitrary value range) and 8-bit raster images.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};

use crate::error::{BcnnError, BcnnResult};

/// A channel-first (`[C, H, W]`) float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageArray {
    /// Wraps a CHW buffer.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidShape` if the buffer length disagrees with the shape.
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> BcnnResult<Self> {
        if data.len() != channels * height * width {
            return Err(BcnnError::InvalidShape {
                expected: format!("{channels}x{height}x{width}"),
                actual: format!("{} values", data.len()),
            });
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// An all-zero image.
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    /// Builds a CHW array from an interleaved HWC buffer.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidShape` if the buffer length disagrees with the shape.
    pub fn from_interleaved(
        channels: usize,
        height: usize,
        width: usize,
        hwc: &[f32],
    ) -> BcnnResult<Self> {
        if hwc.len() != channels * height * width {
            return Err(BcnnError::InvalidShape {
                expected: format!("{height}x{width}x{channels}"),
                actual: format!("{} values", hwc.len()),
            });
        }
        let plane = height * width;
        let mut data = vec![0.0; hwc.len()];
        for (pixel, values) in hwc.chunks_exact(channels).enumerate() {
            for (c, value) in values.iter().enumerate() {
                data[c * plane + pixel] = *value;
            }
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// Interleaved HWC copy of the data.
    pub fn to_interleaved(&self) -> Vec<f32> {
        let plane = self.height * self.width;
        let mut hwc = vec![0.0; self.data.len()];
        for c in 0..self.channels {
            for pixel in 0..plane {
                hwc[pixel * self.channels + c] = self.data[c * plane + pixel];
            }
        }
        hwc
    }

    /// Number of channels.
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Height in pixels.
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Width in pixels.
    pub const fn width(&self) -> usize {
        self.width
    }

    /// `[C, H, W]`.
    pub const fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    /// Raw CHW data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable raw CHW data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the array and returns the CHW buffer.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// One channel as a row-major `H * W` slice.
    pub fn plane(&self, channel: usize) -> &[f32] {
        let plane = self.height * self.width;
        &self.data[channel * plane..(channel + 1) * plane]
    }

    /// Mutable access to one channel.
    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        let plane = self.height * self.width;
        &mut self.data[channel * plane..(channel + 1) * plane]
    }

    /// Value at `(channel, row, col)`.
    pub fn get(&self, channel: usize, row: usize, col: usize) -> f32 {
        self.data[(channel * self.height + row) * self.width + col]
    }

    /// Applies `f` to every value.
    pub fn map(mut self, f: impl Fn(f32) -> f32) -> Self {
        self.data.iter_mut().for_each(|v| *v = f(*v));
        self
    }

    /// Mean over all values.
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|v| f64::from(*v)).sum::<f64>() as f32 / self.data.len() as f32
    }

    /// Mean over channels, giving a single-channel array.
    pub fn channel_mean(&self) -> Self {
        let plane = self.height * self.width;
        let mut data = vec![0.0; plane];
        for c in 0..self.channels {
            for (acc, v) in data.iter_mut().zip(self.plane(c)) {
                *acc += *v;
            }
        }
        let n = self.channels.max(1) as f32;
        data.iter_mut().for_each(|v| *v /= n);
        Self {
            channels: 1,
            height: self.height,
            width: self.width,
            data,
        }
    }

    /// Converts to a `[C, H, W]` tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        let data = TensorData::new(self.data.clone(), self.shape());
        Tensor::from_data(data.convert::<B::FloatElem>(), device)
    }

    /// Reads a `[C, H, W]` tensor back into an array.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::InvalidShape` if the tensor data cannot be read as `f32`.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 3>) -> BcnnResult<Self> {
        let [channels, height, width] = tensor.dims();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| BcnnError::InvalidShape {
                expected: "f32 tensor data".to_string(),
                actual: format!("{e:?}"),
            })?;
        Self::new(channels, height, width, values)
    }
}

/// Metadata carried along with a loaded image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMeta {
    /// Pixel spacing `(x, y)`.
    pub spacing: (f64, f64),
    /// Element type the file stored, e.g. `MET_FLOAT` or `u8`.
    pub element_type: String,
}

impl Default for ImageMeta {
    fn default() -> Self {
        Self {
            spacing: (1.0, 1.0),
            element_type: "MET_FLOAT".to_string(),
        }
    }
}

fn is_meta_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mha") || ext.eq_ignore_ascii_case("mhd"))
}

/// Loads an image as a float array.
///
/// MetaImage files (`.mha`/`.mhd`) keep their stored values. Raster formats
/// decoded by the `image` crate are scaled to `[0, 1]`; grayscale files give one
/// channel and everything else three.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn load_image(path: impl AsRef<Path>) -> BcnnResult<(ImageArray, ImageMeta)> {
    let path = path.as_ref();
    if is_meta_image(path) {
        return read_meta_image(path);
    }

    let img = image::open(path)?;
    let element_type = format!("{:?}", img.color());
    let array = dynamic_image_to_array(img);
    Ok((
        array,
        ImageMeta {
            spacing: (1.0, 1.0),
            element_type,
        },
    ))
}

/// Converts a decoded raster image into a float array with values in `[0, 1]`.
pub fn dynamic_image_to_array(img: DynamicImage) -> ImageArray {
    let (width, height) = (img.width() as usize, img.height() as usize);
    if img.color().has_color() {
        let rgb = img.into_rgb32f();
        ImageArray::from_interleaved(3, height, width, rgb.as_raw())
            .unwrap_or_else(|_| ImageArray::zeros(3, height, width))
    } else {
        let luma = img.to_luma32f();
        ImageArray {
            channels: 1,
            height,
            width,
            data: luma.into_raw(),
        }
    }
}

/// Saves an array.
///
/// `.mha`/`.mhd` paths are written as `MET_FLOAT` MetaImage with the values
/// unchanged; other extensions go through the `image` crate after clamping to
/// `[0, 1]`.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the channel count cannot be
/// represented by the raster format.
pub fn save_image(path: impl AsRef<Path>, array: &ImageArray, meta: &ImageMeta) -> BcnnResult<()> {
    let path = path.as_ref();
    if is_meta_image(path) {
        return write_meta_image(path, array, meta);
    }
    array_to_dynamic_image(array)?.save(path)?;
    Ok(())
}

/// Converts a `[0, 1]` float array to an 8-bit raster image.
///
/// # Errors
///
/// Returns `BcnnError::InvalidShape` unless the array has one or three channels.
pub fn array_to_dynamic_image(array: &ImageArray) -> BcnnResult<DynamicImage> {
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let (width, height) = (array.width as u32, array.height as u32);
    let invalid = || BcnnError::InvalidShape {
        expected: "1 or 3 channels".to_string(),
        actual: format!("{:?}", array.shape()),
    };
    match array.channels {
        1 => {
            let buf: Vec<u8> = array.data.iter().map(|v| to_u8(*v)).collect();
            GrayImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(invalid)
        }
        3 => {
            let buf: Vec<u8> = array.to_interleaved().into_iter().map(to_u8).collect();
            RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

/// A single channel as an `image` buffer, for the resampling routines.
pub(crate) fn plane_to_buffer(array: &ImageArray, channel: usize) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    ImageBuffer::from_raw(
        array.width as u32,
        array.height as u32,
        array.plane(channel).to_vec(),
    )
    .unwrap_or_else(|| ImageBuffer::new(array.width as u32, array.height as u32))
}

// --- MetaImage ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetElement {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl MetElement {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "MET_CHAR" => Self::Char,
            "MET_UCHAR" => Self::UChar,
            "MET_SHORT" => Self::Short,
            "MET_USHORT" => Self::UShort,
            "MET_INT" => Self::Int,
            "MET_UINT" => Self::UInt,
            "MET_FLOAT" => Self::Float,
            "MET_DOUBLE" => Self::Double,
            _ => return None,
        })
    }

    const fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Double => 8,
        }
    }

    fn decode(self, bytes: &[u8], big_endian: bool) -> f32 {
        macro_rules! read {
            ($ty:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(bytes);
                if big_endian {
                    <$ty>::from_be_bytes(raw)
                } else {
                    <$ty>::from_le_bytes(raw)
                }
            }};
        }
        match self {
            Self::Char => f32::from(bytes[0] as i8),
            Self::UChar => f32::from(bytes[0]),
            Self::Short => f32::from(read!(i16, 2)),
            Self::UShort => f32::from(read!(u16, 2)),
            Self::Int => read!(i32, 4) as f32,
            Self::UInt => read!(u32, 4) as f32,
            Self::Float => read!(f32, 4),
            Self::Double => read!(f64, 8) as f32,
        }
    }
}

#[derive(Debug, Default)]
struct MetaHeader {
    ndims: Option<usize>,
    dim_size: Vec<usize>,
    channels: usize,
    element: Option<MetElement>,
    element_name: String,
    big_endian: bool,
    compressed: bool,
    spacing: Vec<f64>,
    data_file: Option<String>,
}

fn read_meta_image(path: &Path) -> BcnnResult<(ImageArray, ImageMeta)> {
    let bytes = fs::read(path)?;
    let error = |reason: String| BcnnError::MetaImage {
        path: path.to_path_buf(),
        reason,
    };

    let mut header = MetaHeader {
        channels: 1,
        ..MetaHeader::default()
    };
    let mut offset = 0;
    while header.data_file.is_none() {
        let rest = &bytes[offset..];
        let line_len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| error("header ended before ElementDataFile".to_string()))?;
        let line = std::str::from_utf8(&rest[..line_len])
            .map_err(|_| error("header is not valid UTF-8".to_string()))?
            .trim();
        offset += line_len + 1;

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        let parse_list = |value: &str| -> Vec<String> {
            value.split_whitespace().map(str::to_string).collect()
        };
        match key {
            "NDims" => {
                header.ndims = Some(
                    value
                        .parse()
                        .map_err(|_| error(format!("invalid NDims `{value}`")))?,
                );
            }
            "DimSize" => {
                header.dim_size = parse_list(value)
                    .iter()
                    .map(|v| v.parse::<usize>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| error(format!("invalid DimSize `{value}`")))?;
            }
            "ElementNumberOfChannels" => {
                header.channels = value
                    .parse()
                    .map_err(|_| error(format!("invalid channel count `{value}`")))?;
            }
            "ElementType" => {
                header.element = MetElement::parse(value);
                header.element_name = value.to_string();
            }
            "BinaryDataByteOrderMSB" | "ElementByteOrderMSB" => {
                header.big_endian = value.eq_ignore_ascii_case("true");
            }
            "CompressedData" => {
                header.compressed = value.eq_ignore_ascii_case("true");
            }
            "ElementSpacing" | "ElementSize" => {
                header.spacing = parse_list(value)
                    .iter()
                    .filter_map(|v| v.parse::<f64>().ok())
                    .collect();
            }
            "ElementDataFile" => header.data_file = Some(value.to_string()),
            _ => {}
        }
    }

    if header.compressed {
        return Err(error("compressed payloads are not supported".to_string()));
    }
    let element = header
        .element
        .ok_or_else(|| error(format!("unsupported ElementType `{}`", header.element_name)))?;
    let ndims = header.ndims.unwrap_or(header.dim_size.len());
    let (width, height) = match (ndims, header.dim_size.as_slice()) {
        (2, [w, h]) => (*w, *h),
        (3, [w, h, 1]) => (*w, *h),
        _ => {
            return Err(error(format!(
                "only 2D images are supported (NDims = {ndims}, DimSize = {:?})",
                header.dim_size
            )))
        }
    };

    let payload = match header.data_file.as_deref().unwrap_or("LOCAL") {
        "LOCAL" => bytes[offset..].to_vec(),
        file => {
            let raw_path: PathBuf = path.parent().unwrap_or(Path::new(".")).join(file);
            fs::read(&raw_path)?
        }
    };

    let count = width * height * header.channels;
    let needed = count * element.size();
    if payload.len() < needed {
        return Err(error(format!(
            "payload has {} bytes, expected {needed}",
            payload.len()
        )));
    }
    let hwc: Vec<f32> = payload[..needed]
        .chunks_exact(element.size())
        .map(|chunk| element.decode(chunk, header.big_endian))
        .collect();

    let array = ImageArray::from_interleaved(header.channels, height, width, &hwc)?;
    let spacing = match header.spacing.as_slice() {
        [x, y, ..] => (*x, *y),
        _ => (1.0, 1.0),
    };
    Ok((
        array,
        ImageMeta {
            spacing,
            element_type: header.element_name,
        },
    ))
}

fn write_meta_image(path: &Path, array: &ImageArray, meta: &ImageMeta) -> BcnnResult<()> {
    let mut file = fs::File::create(path)?;
    write!(
        file,
        "ObjectType = Image\n\
         NDims = 2\n\
         BinaryData = True\n\
         BinaryDataByteOrderMSB = False\n\
         CompressedData = False\n\
         ElementSpacing = {} {}\n\
         DimSize = {} {}\n\
         ElementNumberOfChannels = {}\n\
         ElementType = MET_FLOAT\n\
         ElementDataFile = LOCAL\n",
        meta.spacing.0, meta.spacing.1, array.width, array.height, array.channels
    )?;
    let payload: Vec<u8> = array
        .to_interleaved()
        .into_iter()
        .flat_map(f32::to_le_bytes)
        .collect();
    file.write_all(&payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    fn gradient(channels: usize, height: usize, width: usize) -> ImageArray {
        let data = (0..channels * height * width).map(|v| v as f32 * 0.5 - 3.0).collect();
        ImageArray::new(channels, height, width, data).unwrap()
    }

    #[test]
    fn interleaving_is_reversible() {
        let array = gradient(3, 4, 5);
        let hwc = array.to_interleaved();

        assert_eq!(hwc[0], array.get(0, 0, 0));
        assert_eq!(hwc[1], array.get(1, 0, 0));
        assert_eq!(hwc[3], array.get(0, 0, 1));
        assert_eq!(ImageArray::from_interleaved(3, 4, 5, &hwc).unwrap(), array);
    }

    #[test]
    fn wrong_buffer_length_is_rejected() {
        assert!(matches!(
            ImageArray::new(3, 2, 2, vec![0.0; 11]),
            Err(BcnnError::InvalidShape { .. })
        ));
    }

    #[test]
    fn meta_image_keeps_values_and_spacing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_a.mha");
        let array = gradient(3, 6, 7);
        let meta = ImageMeta {
            spacing: (0.5, 2.0),
            ..ImageMeta::default()
        };

        save_image(&path, &array, &meta).unwrap();
        let (loaded, loaded_meta) = load_image(&path).unwrap();

        assert_eq!(loaded, array);
        assert_eq!(loaded_meta.spacing, (0.5, 2.0));
        assert_eq!(loaded_meta.element_type, "MET_FLOAT");
    }

    #[test]
    fn meta_image_reads_big_endian_shorts_from_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let header = "ObjectType = Image\nNDims = 2\nDimSize = 2 1\n\
                      BinaryDataByteOrderMSB = True\nElementType = MET_SHORT\n\
                      ElementDataFile = payload.raw\n";
        fs::write(dir.path().join("image.mhd"), header).unwrap();
        let payload: Vec<u8> = [-2i16, 300].iter().flat_map(|v| v.to_be_bytes()).collect();
        fs::write(dir.path().join("payload.raw"), payload).unwrap();

        let (loaded, _) = load_image(dir.path().join("image.mhd")).unwrap();

        assert_eq!(loaded.shape(), [1, 1, 2]);
        assert_eq!(loaded.data(), &[-2.0, 300.0]);
    }

    #[test]
    fn truncated_meta_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mha");
        fs::write(
            &path,
            "NDims = 2\nDimSize = 4 4\nElementType = MET_FLOAT\nElementDataFile = LOCAL\n\0\0",
        )
        .unwrap();

        match load_image(&path) {
            Err(BcnnError::MetaImage { reason, .. }) => assert!(reason.contains("payload")),
            other => panic!("Expected MetaImage error, got {other:?}"),
        }
    }

    #[test]
    fn raster_round_trip_is_quantized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        let array = gradient(3, 4, 4).map(|v| (v + 3.0) / 24.0);

        save_image(&path, &array, &ImageMeta::default()).unwrap();
        let (loaded, _) = load_image(&path).unwrap();

        assert_eq!(loaded.shape(), [3, 4, 4]);
        for (a, b) in loaded.data().iter().zip(array.data()) {
            assert!((a - b).abs() <= 1.0 / 255.0);
        }
    }

    #[test]
    fn tensor_conversion_preserves_layout() {
        let device = NdArrayDevice::default();
        let array = gradient(2, 3, 4);

        let tensor = array.to_tensor::<NdArray>(&device);
        assert_eq!(tensor.dims(), [2, 3, 4]);

        let back = ImageArray::from_tensor(tensor).unwrap();
        assert_eq!(back, array);
    }

    #[test]
    fn channel_mean_averages_planes() {
        let array = ImageArray::new(2, 1, 2, vec![1.0, 2.0, 3.0, 6.0]).unwrap();
        assert_eq!(array.channel_mean().data(), &[2.0, 4.0]);
        assert_eq!(array.mean(), 3.0);
    }
}
