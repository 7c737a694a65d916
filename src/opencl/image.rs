//! Two-dimensional image surfaces
//!
//! An [`ImageSurface`] is either generated from a display texture owned by
//! a GL context shared with the compute context, or allocated directly in
//! one of the [`PixelFormat`]s. Host transfers take slices of any primitive
//! type; only the byte size of the slice is checked against the region.
//! Row pitches are in bytes, and zero means tightly packed rows.

use std::ops::{Deref, DerefMut};

use log::{debug, trace, warn};
use ocl::OclPrm;
use ocl::core::{
    self, Event as CoreEvent, ImageChannelDataType, ImageChannelOrder, ImageDescriptor,
    ImageFormat, ImageInfo, ImageInfoResult, Mem, MemMap as CoreMemMap, MemObjectType,
};
use ocl::flags::MapFlags;

use super::buffer::{BufferOptions, MemoryBuffer};
use super::context::ComputeContext;
use crate::error::{ComputeError, Result};

/// `GL_TEXTURE_2D`
pub const GL_TEXTURE_2D: u32 = 0x0DE1;
/// `GL_TEXTURE_RECTANGLE`
pub const GL_TEXTURE_RECTANGLE: u32 = 0x84F5;

/// Channels per pixel of an allocated surface
pub const CHANNELS: usize = 4;

/// Pixel layout of an allocated surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Four `f32` channels
    #[default]
    RgbaFloat,
    /// Four normalised `u8` channels, the usual display texture layout
    RgbaUnorm8,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn pixel_size(self) -> usize {
        match self {
            PixelFormat::RgbaFloat => CHANNELS * std::mem::size_of::<f32>(),
            PixelFormat::RgbaUnorm8 => CHANNELS,
        }
    }

    fn to_ocl(self) -> ImageFormat {
        let data_type = match self {
            PixelFormat::RgbaFloat => ImageChannelDataType::Float,
            PixelFormat::RgbaUnorm8 => ImageChannelDataType::UnormInt8,
        };
        ImageFormat::new(ImageChannelOrder::Rgba, data_type)
    }
}

/// A texture created by the display layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRef {
    pub name: u32,
    pub target: u32,
    pub mip_level: i32,
}

impl TextureRef {
    pub fn new(name: u32) -> Self {
        Self {
            name,
            target: GL_TEXTURE_2D,
            mip_level: 0,
        }
    }

    pub fn with_target(mut self, target: u32) -> Self {
        self.target = target;
        self
    }

    pub fn with_mip_level(mut self, mip_level: i32) -> Self {
        self.mip_level = mip_level;
        self
    }
}

/// Rectangle of pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub origin: [usize; 2],
    pub size: [usize; 2],
}

impl Region {
    pub fn new(origin: [usize; 2], size: [usize; 2]) -> Self {
        Self { origin, size }
    }

    /// Whole surface of `width` x `height`
    pub fn full(width: usize, height: usize) -> Self {
        Self::new([0, 0], [width, height])
    }

    pub fn pixels(&self) -> usize {
        self.size[0].saturating_mul(self.size[1])
    }

    fn origin3(&self) -> [usize; 3] {
        [self.origin[0], self.origin[1], 0]
    }

    fn region3(&self) -> [usize; 3] {
        [self.size[0], self.size[1], 1]
    }

    fn fits(&self, width: usize, height: usize) -> bool {
        let inside = |origin: usize, size: usize, limit: usize| {
            size > 0 && origin.checked_add(size).is_some_and(|end| end <= limit)
        };
        inside(self.origin[0], self.size[0], width) && inside(self.origin[1], self.size[1], height)
    }

    /// Host bytes spanned by this region with rows `row_pitch` bytes apart
    ///
    /// `None` when the pitch is shorter than one row or the size overflows.
    fn host_bytes(&self, element_size: usize, row_pitch: usize) -> Option<usize> {
        let row = self.size[0].checked_mul(element_size)?;
        let pitch = if row_pitch == 0 { row } else { row_pitch };
        if pitch < row {
            return None;
        }
        pitch
            .checked_mul(self.size[1].checked_sub(1)?)?
            .checked_add(row)
    }
}

/// Compute-accessible 2-D image
pub struct ImageSurface {
    mem: Mem,
    context: ComputeContext,
    index: u32,
    width: usize,
    height: usize,
    element_size: usize,
    options: BufferOptions,
    texture: Option<TextureRef>,
}

impl ImageSurface {
    /// Creates the compute-side image for an external texture
    ///
    /// The context must have been acquired with a matching
    /// [`SharedContext`](crate::config::SharedContext).
    pub fn generate(
        context: &ComputeContext,
        index: u32,
        texture: TextureRef,
        options: &BufferOptions,
    ) -> Result<Self> {
        // SAFETY: the texture handle is owned by the display layer and must
        // outlive the image; nothing else is dereferenced.
        let mem = unsafe {
            core::create_from_gl_texture(
                context.ocl_context().as_core(),
                texture.target,
                texture.mip_level,
                texture.name,
                options.mem_flags(),
                None,
            )
        }
        .map_err(|e| {
            ComputeError::Allocation(format!(
                "Failed to create image from texture {}: {}",
                texture.name, e
            ))
        })?;
        let surface = Self::from_mem(context, mem, index, options, Some(texture))?;
        debug!(
            "Image {} generated from texture {} ({}x{})",
            index, texture.name, surface.width, surface.height
        );
        Ok(surface)
    }

    /// Allocates an RGBA float image, optionally initialised from `host`
    pub fn allocate(
        context: &ComputeContext,
        index: u32,
        width: usize,
        height: usize,
        options: &BufferOptions,
        host: Option<&[f32]>,
    ) -> Result<Self> {
        Self::allocate_with_format(
            context,
            index,
            width,
            height,
            PixelFormat::RgbaFloat,
            options,
            host,
        )
    }

    /// Allocates an image in `pixel_format`
    ///
    /// When present, `host` must cover the whole image exactly, in bytes.
    pub fn allocate_with_format<T: OclPrm>(
        context: &ComputeContext,
        index: u32,
        width: usize,
        height: usize,
        pixel_format: PixelFormat,
        options: &BufferOptions,
        host: Option<&[T]>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ComputeError::Allocation(format!(
                "Image {} has empty size {}x{}",
                index, width, height
            )));
        }
        let image_bytes = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(pixel_format.pixel_size()))
            .ok_or_else(|| {
                ComputeError::Allocation(format!(
                    "Image {} size {}x{} overflows",
                    index, width, height
                ))
            })?;
        if let Some(data) = host
            && std::mem::size_of_val(data) != image_bytes
        {
            return Err(ComputeError::Allocation(format!(
                "Image {}: host data has {} bytes, {}x{} {:?} needs {}",
                index,
                std::mem::size_of_val(data),
                width,
                height,
                pixel_format,
                image_bytes
            )));
        }

        let format = pixel_format.to_ocl();
        let descriptor =
            ImageDescriptor::new(MemObjectType::Image2d, width, height, 0, 0, 0, 0, None);
        let mut flags = options.mem_flags();
        if host.is_some() {
            flags |= ocl::flags::MEM_COPY_HOST_PTR;
        }
        // SAFETY: when present, `host` covers the whole image and is copied
        // during creation.
        let mem = unsafe {
            core::create_image(
                context.ocl_context().as_core(),
                flags,
                &format,
                &descriptor,
                host,
                None,
            )
        }
        .map_err(|e| {
            ComputeError::Allocation(format!(
                "Failed to allocate image {} ({}x{}): {}",
                index, width, height, e
            ))
        })?;
        debug!(
            "Image {} allocated ({}x{} {:?})",
            index, width, height, pixel_format
        );
        Self::from_mem(context, mem, index, options, None)
    }

    fn from_mem(
        context: &ComputeContext,
        mem: Mem,
        index: u32,
        options: &BufferOptions,
        texture: Option<TextureRef>,
    ) -> Result<Self> {
        let query = |info: ImageInfo| -> Result<usize> {
            match core::get_image_info(&mem, info) {
                Ok(ImageInfoResult::Width(n))
                | Ok(ImageInfoResult::Height(n))
                | Ok(ImageInfoResult::ElementSize(n)) => Ok(n),
                Ok(other) => Err(ComputeError::Allocation(format!(
                    "Unexpected image info for image {}: {:?}",
                    index, other
                ))),
                Err(e) => Err(ComputeError::Allocation(format!(
                    "Failed to query image {}: {}",
                    index, e
                ))),
            }
        };
        let width = query(ImageInfo::Width)?;
        let height = query(ImageInfo::Height)?;
        let element_size = query(ImageInfo::ElementSize)?;

        Ok(Self {
            mem,
            context: context.clone(),
            index,
            width,
            height,
            element_size,
            options: *options,
            texture,
        })
    }

    /// Kernel argument index this image binds to
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes per pixel
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    /// Source texture, `None` for allocated images
    pub fn texture(&self) -> Option<TextureRef> {
        self.texture
    }

    pub(crate) fn as_mem(&self) -> &Mem {
        &self.mem
    }

    fn check_region(&self, region: &Region, op: &str) -> Result<()> {
        if !region.fits(self.width, self.height) {
            return Err(ComputeError::Transfer(format!(
                "Image {} {}: region {:?} outside {}x{}",
                self.index, op, region, self.width, self.height
            )));
        }
        Ok(())
    }

    fn check_host<T: OclPrm>(
        &self,
        region: &Region,
        row_pitch: usize,
        host_len: usize,
        op: &str,
    ) -> Result<()> {
        let needed = region.host_bytes(self.element_size, row_pitch).ok_or_else(|| {
            ComputeError::Transfer(format!(
                "Image {} {}: row pitch {} does not fit {} pixels of {} bytes",
                self.index, op, row_pitch, region.size[0], self.element_size
            ))
        })?;
        let supplied = host_len.saturating_mul(std::mem::size_of::<T>());
        if supplied < needed {
            return Err(ComputeError::Transfer(format!(
                "Image {} {}: host slice holds {} bytes, region needs {}",
                self.index, op, supplied, needed
            )));
        }
        Ok(())
    }

    /// Copies a rectangle from the device into `dst`, rows `row_pitch` bytes apart
    pub fn read<T: OclPrm>(&self, region: &Region, row_pitch: usize, dst: &mut [T]) -> Result<()> {
        self.check_region(region, "read")?;
        self.check_host::<T>(region, row_pitch, dst.len(), "read")?;
        trace!("read image {} {:?} pitch {}", self.index, region, row_pitch);
        let blocking = self.options.is_blocking();
        // SAFETY: `dst` was checked to cover the pitched region; non-blocking
        // reads are drained before the borrow ends.
        unsafe {
            core::enqueue_read_image(
                self.context.core_queue(),
                &self.mem,
                blocking,
                region.origin3(),
                region.region3(),
                row_pitch,
                0,
                dst,
                None::<&CoreEvent>,
                None::<&mut CoreEvent>,
            )
        }
        .map_err(|e| {
            ComputeError::Transfer(format!("Failed to read image {}: {}", self.index, e))
        })?;
        if !blocking {
            self.drain("read")?;
        }
        Ok(())
    }

    /// Copies `src`, rows `row_pitch` bytes apart, into a rectangle on the device
    pub fn write<T: OclPrm>(&mut self, region: &Region, row_pitch: usize, src: &[T]) -> Result<()> {
        self.check_region(region, "write")?;
        self.check_host::<T>(region, row_pitch, src.len(), "write")?;
        trace!("write image {} {:?} pitch {}", self.index, region, row_pitch);
        let blocking = self.options.is_blocking();
        // SAFETY: `src` was checked to cover the pitched region; non-blocking
        // writes are drained before the borrow ends.
        unsafe {
            core::enqueue_write_image(
                self.context.core_queue(),
                &self.mem,
                blocking,
                region.origin3(),
                region.region3(),
                row_pitch,
                0,
                src,
                None::<&CoreEvent>,
                None::<&mut CoreEvent>,
            )
        }
        .map_err(|e| {
            ComputeError::Transfer(format!("Failed to write image {}: {}", self.index, e))
        })?;
        if !blocking {
            self.drain("write")?;
        }
        Ok(())
    }

    /// Maps `region` into host memory for reading and writing
    ///
    /// Each pixel must hold a whole number of `T`. The mapping is released
    /// when the returned guard is dropped or unmapped.
    pub fn map<T: OclPrm>(&mut self, region: &Region) -> Result<MappedImage<'_, T>> {
        self.check_region(region, "map")?;
        let item = std::mem::size_of::<T>();
        if self.element_size % item != 0 {
            return Err(ComputeError::Transfer(format!(
                "Image {} map: {}-byte pixels cannot be viewed as {}-byte items",
                self.index, self.element_size, item
            )));
        }
        trace!("map image {} {:?}", self.index, region);
        let mut row_pitch = 0;
        let mut slice_pitch = 0;
        // SAFETY: the map is blocking and the guard borrows the image
        // mutably, so no other transfer on it runs while it is alive.
        let map = unsafe {
            core::enqueue_map_image::<T, _, _, _>(
                self.context.core_queue(),
                &self.mem,
                true,
                MapFlags::READ | MapFlags::WRITE,
                region.origin3(),
                region.region3(),
                &mut row_pitch,
                &mut slice_pitch,
                None::<&CoreEvent>,
                None::<&mut CoreEvent>,
            )
        }
        .map_err(|e| {
            ComputeError::Transfer(format!("Failed to map image {}: {}", self.index, e))
        })?;
        let bytes = region.host_bytes(self.element_size, row_pitch).unwrap_or(0);
        Ok(MappedImage {
            map: Some(map),
            image: self,
            region: *region,
            row_pitch,
            len: bytes / item,
        })
    }

    /// Fills `region` (the whole image by default) from a linear buffer
    ///
    /// `src_offset` counts elements of `T`.
    pub fn copy_from_buffer<T: OclPrm>(
        &mut self,
        src: &MemoryBuffer<T>,
        src_offset: usize,
        region: Option<Region>,
    ) -> Result<()> {
        let region = region.unwrap_or(Region::full(self.width, self.height));
        self.check_region(&region, "copy")?;
        let region_bytes = region.pixels().saturating_mul(self.element_size);
        let needed = src_offset
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|offset| offset.checked_add(region_bytes));
        if needed.is_none_or(|needed| needed > src.actual_size()) {
            return Err(ComputeError::Transfer(format!(
                "Image {} copy: buffer {} holds {} bytes, {} needed from element {}",
                self.index,
                src.index(),
                src.actual_size(),
                region_bytes,
                src_offset
            )));
        }
        trace!("copy buffer {} -> image {} {:?}", src.index(), self.index, region);
        core::enqueue_copy_buffer_to_image::<T, _, _, _>(
            self.context.core_queue(),
            src.ocl_buffer().as_core(),
            &self.mem,
            src_offset,
            region.origin3(),
            region.region3(),
            None::<&CoreEvent>,
            None::<&mut CoreEvent>,
        )
        .map_err(|e| {
            ComputeError::Transfer(format!(
                "Failed to copy buffer {} into image {}: {}",
                src.index(),
                self.index,
                e
            ))
        })?;
        if self.options.is_blocking() {
            self.drain("copy")?;
        }
        Ok(())
    }

    /// Copies a rectangle of `src` to `dst_origin`, the whole of `src` by default
    pub fn copy_from_image(
        &mut self,
        src: &ImageSurface,
        region: Option<Region>,
        dst_origin: [usize; 2],
    ) -> Result<()> {
        let region = region.unwrap_or(Region::full(src.width, src.height));
        src.check_region(&region, "copy")?;
        self.check_region(&Region::new(dst_origin, region.size), "copy")?;
        if src.element_size != self.element_size {
            return Err(ComputeError::Transfer(format!(
                "Image {} copy: pixel size {} differs from image {} ({})",
                self.index, self.element_size, src.index, src.element_size
            )));
        }
        trace!("copy image {} -> image {} {:?}", src.index, self.index, region);
        core::enqueue_copy_image(
            self.context.core_queue(),
            &src.mem,
            &self.mem,
            region.origin3(),
            [dst_origin[0], dst_origin[1], 0],
            region.region3(),
            None::<&CoreEvent>,
            None::<&mut CoreEvent>,
        )
        .map_err(|e| {
            ComputeError::Transfer(format!(
                "Failed to copy image {} into image {}: {}",
                src.index, self.index, e
            ))
        })?;
        if self.options.is_blocking() {
            self.drain("copy")?;
        }
        Ok(())
    }

    fn drain(&self, op: &str) -> Result<()> {
        self.context.finish().map_err(|e| {
            ComputeError::Transfer(format!("Image {} {} did not complete: {}", self.index, op, e))
        })
    }
}

/// Host view of a mapped image region
///
/// Rows start `row_pitch()` bytes apart, which may exceed the region width.
pub struct MappedImage<'a, T: OclPrm> {
    map: Option<CoreMemMap<T>>,
    image: &'a ImageSurface,
    region: Region,
    row_pitch: usize,
    len: usize,
}

impl<T: OclPrm> MappedImage<'_, T> {
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Bytes between the starts of consecutive rows
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// Items of row `y` within the region, `None` past the last row
    pub fn row(&self, y: usize) -> Option<&[T]> {
        if y >= self.region.size[1] {
            return None;
        }
        let item = std::mem::size_of::<T>();
        let start = y * self.row_pitch / item;
        let width = self.region.size[0] * self.image.element_size / item;
        self.get(start..start + width)
    }

    /// Releases the mapping and waits until the device sees host writes
    pub fn unmap(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if let Some(map) = self.map.take() {
            core::enqueue_unmap_mem_object(
                self.image.context.core_queue(),
                &self.image.mem,
                &map,
                None::<&CoreEvent>,
                None::<&mut CoreEvent>,
            )
            .map_err(|e| {
                ComputeError::Transfer(format!(
                    "Failed to unmap image {}: {}",
                    self.image.index, e
                ))
            })?;
            self.image.drain("unmap")?;
        }
        Ok(())
    }
}

impl<T: OclPrm> Deref for MappedImage<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.map {
            // SAFETY: the runtime mapped `len` items starting at the pointer,
            // and they stay mapped until `release` takes the map.
            Some(map) => unsafe { map.as_slice(self.len) },
            None => &[],
        }
    }
}

impl<T: OclPrm> DerefMut for MappedImage<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        let len = self.len;
        match &mut self.map {
            // SAFETY: as for `deref`; the guard is borrowed mutably.
            Some(map) => unsafe { map.as_slice_mut(len) },
            None => &mut [],
        }
    }
}

impl<T: OclPrm> std::fmt::Debug for MappedImage<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedImage")
            .field("image", &self.image.index)
            .field("region", &self.region)
            .field("row_pitch", &self.row_pitch)
            .finish()
    }
}

impl<T: OclPrm> Drop for MappedImage<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

impl std::fmt::Debug for ImageSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSurface")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("texture", &self.texture)
            .finish()
    }
}
