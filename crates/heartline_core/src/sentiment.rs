//! Keyword-based English/Chinese sentiment analysis.
//!
//! Only used as the last fallback for affection deltas when neither the LLM
//! nor a selected choice suggests one.

const POSITIVE: &[&str] = &[
    "love", "like", "thank", "great", "awesome", "cute", "sweet", "happy", "glad", "miss you",
    "haha", "lol", "开心", "高兴", "喜欢", "爱", "棒", "谢谢", "哈哈", "😊", "❤️", "😍",
];

const NEGATIVE: &[&str] = &[
    "hate", "boring", "annoying", "stupid", "sad", "angry", "shut up", "go away", "whatever",
    "难过", "伤心", "讨厌", "烦", "无聊", "滚", "😢", "😡", "💔",
];

const INTENSE: &[&str] = &["very", "so much", "really", "非常", "特别", "超级", "太", "!", "！"];

/// Analyze text for emotional valence and intensity.
///
/// Returns `(valence, intensity)` where:
/// - `valence` is in `[-1.0, 1.0]` (negative to positive)
/// - `intensity` is in `[0.1, 1.0]`
pub fn analyze_sentiment(text: &str) -> (f32, f32) {
    let lower = text.to_lowercase();
    let pos = POSITIVE.iter().filter(|w| lower.contains(*w)).count() as f32;
    let neg = NEGATIVE.iter().filter(|w| lower.contains(*w)).count() as f32;
    let int = INTENSE.iter().filter(|w| lower.contains(*w)).count() as f32;

    let valence = (pos - neg) / (pos + neg + 1.0);
    let intensity = ((pos + neg + int) / 5.0).clamp(0.1, 1.0);

    (valence, intensity)
}

/// Heuristic affection delta for a user message: +1 for engaging at all,
/// plus up to +/-3 scaled by valence. Empty input earns nothing.
pub fn affection_heuristic(text: &str) -> i32 {
    if text.trim().is_empty() {
        return 0;
    }
    let (valence, _) = analyze_sentiment(text);
    1 + (valence * 3.0).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_text() {
        let (v, i) = analyze_sentiment("what time is it");
        assert!((v - 0.0).abs() < 0.01);
        assert!((i - 0.1).abs() < 0.01);
    }

    #[test]
    fn test_positive_text() {
        let (v, _) = analyze_sentiment("Thank you, that's so sweet");
        assert!(v > 0.0);
        let (v, _) = analyze_sentiment("我很开心，谢谢你");
        assert!(v > 0.0);
    }

    #[test]
    fn test_negative_text() {
        let (v, _) = analyze_sentiment("this is boring, go away");
        assert!(v < 0.0);
    }

    #[test]
    fn test_heuristic_bounds() {
        assert_eq!(affection_heuristic(""), 0);
        assert_eq!(affection_heuristic("ok"), 1);
        let warm = affection_heuristic("I love this, thank you, you're so cute and sweet");
        assert!(warm > 1 && warm <= 4);
        let cold = affection_heuristic("shut up, you're boring and annoying, I hate this");
        assert!(cold < 0 && cold >= -2);
    }
}
