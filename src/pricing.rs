pub const STANDARD_PRICE_CENTS: i64 = 300;
pub const BULK_PRICE_CENTS: i64 = 250;
/// Orders with more images than this get the bulk rate on every image.
pub const BULK_THRESHOLD: usize = 5;
/// Bounded by the gateway's 500-character metadata values, which carry the file ids.
pub const MAX_IMAGES_PER_ORDER: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub image_count: usize,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

pub fn quote(image_count: usize) -> Option<Quote> {
    if image_count == 0 || image_count > MAX_IMAGES_PER_ORDER {
        return None;
    }
    let unit_price_cents = if image_count > BULK_THRESHOLD {
        BULK_PRICE_CENTS
    } else {
        STANDARD_PRICE_CENTS
    };
    Some(Quote {
        image_count,
        unit_price_cents,
        total_cents: unit_price_cents * image_count as i64,
    })
}
