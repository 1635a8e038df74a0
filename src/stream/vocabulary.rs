//! Fixed token vocabulary

use rand::Rng;

/// The hundred most common English words, drawn uniformly
pub const VOCABULARY: [&str; 100] = [
    "the", "be", "to", "of", "and", "a", "in", "that", "have", "I",
    "it", "for", "not", "on", "with", "he", "as", "you", "do", "at",
    "this", "but", "his", "by", "from", "they", "we", "say", "her", "she",
    "or", "an", "will", "my", "one", "all", "would", "there", "their", "what",
    "so", "up", "out", "if", "about", "who", "get", "which", "go", "me",
    "when", "make", "can", "like", "time", "no", "just", "him", "know", "take",
    "people", "into", "year", "your", "good", "some", "could", "them", "see", "other",
    "than", "then", "now", "look", "only", "come", "its", "over", "think", "also",
    "back", "after", "use", "two", "how", "our", "work", "first", "well", "way",
    "even", "new", "want", "because", "any", "these", "give", "day", "most", "us",
];

/// Draw one token uniformly
pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    VOCABULARY[rng.random_range(0..VOCABULARY.len())]
}

pub fn contains(token: &str) -> bool {
    VOCABULARY.contains(&token)
}
