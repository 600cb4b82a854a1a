//! Column layout of the two datasets.

/// `books_data.csv`: Title, description, authors, image, previewLink,
/// publisher, publishedDate, infoLink, categories, ratingsCount.
pub mod book_columns {
    pub const TITLE: usize = 0;
    pub const AUTHORS: usize = 2;
    pub const PUBLISHER: usize = 5;
    pub const PUBLISHED_DATE: usize = 6;
    pub const CATEGORIES: usize = 8;
}

/// `Books_rating.csv`: Id, Title, Price, User_id, profileName,
/// review/helpfulness, review/score, review/time, review/summary, review/text.
pub mod review_columns {
    pub const TITLE: usize = 1;
    pub const SCORE: usize = 6;
    pub const SUMMARY: usize = 8;
    pub const TEXT: usize = 9;
}

/// Longest value a 1-byte length prefix can carry.
pub const MAX_SHORT_FIELD: usize = u8::MAX as usize;
/// Longest value a 2-byte length prefix can carry.
pub const MAX_LONG_FIELD: usize = u16::MAX as usize;

pub(crate) const POSITIVE_WORDS: &[&str] = &[
    "amazing", "beautiful", "best", "brilliant", "captivating", "charming", "compelling",
    "delightful", "enjoy", "enjoyable", "enjoyed", "excellent", "fantastic", "favorite",
    "fun", "good", "great", "happy", "helpful", "inspiring", "interesting", "love", "loved",
    "lovely", "masterpiece", "nice", "perfect", "pleasure", "recommend", "remarkable",
    "superb", "well", "wonderful",
];

pub(crate) const NEGATIVE_WORDS: &[&str] = &[
    "awful", "bad", "bland", "boring", "confusing", "disappointed", "disappointing", "dull",
    "hate", "hated", "horrible", "mediocre", "mess", "poor", "poorly", "sad", "slow",
    "terrible", "tedious", "ugly", "unreadable", "waste", "weak", "worse", "worst",
];
