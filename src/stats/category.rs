//! Image category classification.
//!
//! A fixed, ordered, case-insensitive substring table over the image URL.
//! First match wins; anything unmatched is `Other Images`. The table order
//! is load-bearing — "thumb" must be tested before "product" so a product
//! thumbnail lands in Thumbnails.

use crate::models::ImageCategory;

/// Ordered lookup table. Each entry is (substring, category).
const CATEGORY_PATTERNS: &[(&str, ImageCategory)] = &[
    ("hero", ImageCategory::HeroAndBanners),
    ("banner", ImageCategory::HeroAndBanners),
    ("slider", ImageCategory::HeroAndBanners),
    ("carousel", ImageCategory::HeroAndBanners),
    ("thumb", ImageCategory::Thumbnails),
    ("preview", ImageCategory::Thumbnails),
    ("product", ImageCategory::ProductImages),
    ("catalog", ImageCategory::ProductImages),
    ("item", ImageCategory::ProductImages),
    ("shop", ImageCategory::ProductImages),
    ("blog", ImageCategory::BlogAndArticles),
    ("article", ImageCategory::BlogAndArticles),
    ("post", ImageCategory::BlogAndArticles),
    ("news", ImageCategory::BlogAndArticles),
    ("logo", ImageCategory::LogosAndIcons),
    ("icon", ImageCategory::LogosAndIcons),
    ("favicon", ImageCategory::LogosAndIcons),
    ("sprite", ImageCategory::LogosAndIcons),
    ("avatar", ImageCategory::UserAvatars),
    ("profile", ImageCategory::UserAvatars),
    ("user", ImageCategory::UserAvatars),
    ("background", ImageCategory::Backgrounds),
    ("bg-", ImageCategory::Backgrounds),
    ("-bg", ImageCategory::Backgrounds),
    ("backdrop", ImageCategory::Backgrounds),
];

/// Classify an image URL into the fixed category set.
#[must_use]
pub fn classify_image_url(url: &str) -> ImageCategory {
    let lowered = url.to_lowercase();
    for (needle, category) in CATEGORY_PATTERNS {
        if lowered.contains(needle) {
            return *category;
        }
    }
    ImageCategory::OtherImages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_url_shapes() {
        assert_eq!(
            classify_image_url("https://e.com/assets/hero-home.jpg"),
            ImageCategory::HeroAndBanners
        );
        assert_eq!(
            classify_image_url("https://e.com/img/products/shoe.png"),
            ImageCategory::ProductImages
        );
        assert_eq!(
            classify_image_url("https://cdn.e.com/LOGO.svg"),
            ImageCategory::LogosAndIcons
        );
        assert_eq!(
            classify_image_url("https://e.com/users/42/avatar.webp"),
            ImageCategory::UserAvatars
        );
        assert_eq!(
            classify_image_url("https://e.com/blog/2024/cover.jpg"),
            ImageCategory::BlogAndArticles
        );
        assert_eq!(
            classify_image_url("https://e.com/static/bg-dark.png"),
            ImageCategory::Backgrounds
        );
    }

    #[test]
    fn first_match_wins_on_ambiguous_urls() {
        // Contains both "thumb" and "product"; the table tests "thumb" first.
        assert_eq!(
            classify_image_url("https://e.com/product/thumb/1.jpg"),
            ImageCategory::Thumbnails
        );
        // Contains both "hero" and "blog"; "hero" is earlier.
        assert_eq!(
            classify_image_url("https://e.com/blog/hero.jpg"),
            ImageCategory::HeroAndBanners
        );
    }

    #[test]
    fn unmatched_urls_fall_through() {
        assert_eq!(
            classify_image_url("https://e.com/a/b/c.png"),
            ImageCategory::OtherImages
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(
            classify_image_url("https://e.com/PRODUCT/X.JPG"),
            ImageCategory::ProductImages
        );
    }
}
