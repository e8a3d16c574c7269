use std::collections::HashMap;

use chrono::{Duration, TimeZone, Utc};
use rand::{seq::SliceRandom, Rng};
use threadline_api::{AuthorProfile, CommentId, CommentRecord, PostId, Time, UserId};

pub const NUM_USERS: usize = 8;
pub const MAX_BODY_WORDS: usize = 40;
pub const MAX_LIKES: u32 = 50;

/// Probability for each generated comment to be a reply rather than a root
pub const REPLY_PROBABILITY: f64 = 0.6;

pub fn start_time() -> Time {
    Utc.timestamp_opt(1_640_995_200, 0).unwrap()
}

pub fn gen_user(rng: &mut impl Rng) -> UserId {
    UserId(format!("user{}", rng.gen_range(0..NUM_USERS)))
}

pub fn gen_profiles() -> HashMap<UserId, AuthorProfile> {
    (0..NUM_USERS)
        .map(|i| {
            (
                UserId(format!("user{i}")),
                AuthorProfile {
                    display_name: lipsum::lipsum_title(),
                    avatar_url: Some(format!("https://avatars.invalid/user{i}.png")),
                },
            )
        })
        .collect()
}

/// Flat, shuffled list of `num_comments` comments forming a consistent
/// thread: parents exist, reply counts match, replies are younger than
/// their parent
pub fn gen_thread(rng: &mut impl Rng, post: &PostId, num_comments: usize) -> Vec<CommentRecord> {
    let mut res: Vec<CommentRecord> = Vec::with_capacity(num_comments);
    for i in 0..num_comments {
        let parent = match i > 0 && rng.gen_bool(REPLY_PROBABILITY) {
            true => Some(rng.gen_range(0..i)),
            false => None,
        };
        if let Some(p) = parent {
            res[p].reply_count += 1;
        }
        let words = rng.gen_range(1..=MAX_BODY_WORDS);
        res.push(CommentRecord {
            id: CommentId(format!("c{i}")),
            post_id: post.clone(),
            parent_id: parent.map(|p| res[p].id.clone()),
            author_id: gen_user(rng),
            body: lipsum::lipsum_words_from_seed(words, rng.gen()),
            created_at: start_time() + Duration::seconds(i as i64 * 60 + rng.gen_range(0..60)),
            like_count: rng.gen_range(0..=MAX_LIKES),
            reply_count: 0,
            author_profile: None,
            is_pending: false,
        });
    }
    res.shuffle(rng);
    res
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_threads_are_consistent() {
        let mut rng = rand::thread_rng();
        let thread = gen_thread(&mut rng, &PostId::from("post"), 300);
        let ids = thread.iter().map(|c| &c.id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 300);
        let by_id = thread.iter().map(|c| (&c.id, c)).collect::<HashMap<_, _>>();
        for c in &thread {
            if let Some(p) = &c.parent_id {
                assert!(by_id[p].created_at < c.created_at);
            }
            let replies = thread
                .iter()
                .filter(|r| r.parent_id.as_ref() == Some(&c.id))
                .count();
            assert_eq!(c.reply_count as usize, replies);
            assert!(threadline_api::validate_body(&c.body).is_ok());
        }
    }
}
