//! Curated feed scoring (spec §6): a deterministic ranking function over
//! posts in a 72-hour window, used by `GET /posts?type=curated`.

use chrono::Utc;

use crate::db::models::Post;

const WINDOW_HOURS: f64 = 72.0;

pub struct ScoreInputs {
    pub likes: i64,
    pub reposts: i64,
    pub replies: i64,
    pub age_hours: f64,
    /// Does the viewer follow the post's author?
    pub follow: bool,
    /// Is the viewer the post's author?
    pub is_self: bool,
}

/// `score = 1.4*ln(1 + likes + 2*reposts + 0.5*replies) + 1.1*max(0, 1 -
/// ageHours/72) + 0.9*follow + 0.5*self` (spec §6).
pub fn score(inputs: &ScoreInputs) -> f64 {
    let engagement = 1.0
        + inputs.likes as f64
        + 2.0 * inputs.reposts as f64
        + 0.5 * inputs.replies as f64;
    let recency = (1.0 - inputs.age_hours / WINDOW_HOURS).max(0.0);
    1.4 * engagement.ln()
        + 1.1 * recency
        + 0.9 * if inputs.follow { 1.0 } else { 0.0 }
        + 0.5 * if inputs.is_self { 1.0 } else { 0.0 }
}

/// Sorts `posts` (already filtered to the 72h window and paired with
/// viewer-relative `follow`/`is_self` flags) by score descending, tie-broken
/// by `createdAt` descending (spec §6).
pub fn rank(mut posts: Vec<(Post, bool, bool)>) -> Vec<Post> {
    let now = Utc::now();
    let mut scored: Vec<(f64, Post)> = posts
        .drain(..)
        .map(|(post, follow, is_self)| {
            let age_hours = now
                .signed_duration_since(post.created_at)
                .num_seconds() as f64
                / 3600.0;
            let inputs = ScoreInputs {
                likes: post.likes_count,
                reposts: post.reposts_count,
                replies: post.replies_count,
                age_hours,
                follow,
                is_self,
            };
            (score(&inputs), post)
        })
        .collect();

    scored.sort_by(|(score_a, post_a), (score_b, post_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| post_b.created_at.cmp(&post_a.created_at))
    });
    scored.into_iter().map(|(_, post)| post).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_engagement_scores_higher() {
        let low = score(&ScoreInputs {
            likes: 0,
            reposts: 0,
            replies: 0,
            age_hours: 1.0,
            follow: false,
            is_self: false,
        });
        let high = score(&ScoreInputs {
            likes: 50,
            reposts: 10,
            replies: 5,
            age_hours: 1.0,
            follow: false,
            is_self: false,
        });
        assert!(high > low);
    }

    #[test]
    fn older_posts_score_lower_all_else_equal() {
        let fresh = score(&ScoreInputs {
            likes: 5,
            reposts: 1,
            replies: 1,
            age_hours: 1.0,
            follow: false,
            is_self: false,
        });
        let stale = score(&ScoreInputs {
            likes: 5,
            reposts: 1,
            replies: 1,
            age_hours: 71.0,
            follow: false,
            is_self: false,
        });
        assert!(fresh > stale);
    }

    #[test]
    fn follow_and_self_add_fixed_bonuses() {
        let base = score(&ScoreInputs {
            likes: 5,
            reposts: 0,
            replies: 0,
            age_hours: 10.0,
            follow: false,
            is_self: false,
        });
        let followed = score(&ScoreInputs {
            likes: 5,
            reposts: 0,
            replies: 0,
            age_hours: 10.0,
            follow: true,
            is_self: false,
        });
        assert!((followed - base - 0.9).abs() < 1e-9);
    }
}
