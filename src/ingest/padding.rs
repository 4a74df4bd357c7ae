use image::{imageops, GenericImageView, ImageBuffer, Pixel, Primitive};

/// Place `image` in the top-left corner of a `pad_width` x `pad_height`
/// canvas filled with `color`.
///
/// Returns `None` when the image does not fit, so callers never stretch or crop
/// by accident.
pub fn pad_to<I, P, S>(
    image: &I,
    pad_width: u32,
    pad_height: u32,
    color: P,
) -> Option<ImageBuffer<P, Vec<S>>>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S>,
    S: Primitive,
{
    let (width, height) = image.dimensions();
    if width > pad_width || height > pad_height {
        return None;
    }

    let mut canvas = ImageBuffer::from_pixel(pad_width, pad_height, color);
    imageops::replace(&mut canvas, image, 0, 0);
    Some(canvas)
}
