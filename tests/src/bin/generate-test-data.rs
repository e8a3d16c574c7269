use threadline_api::PostId;

const NUM_POSTS: usize = 3;
const NUM_COMMENTS_PER_POST: usize = 150;

#[derive(serde::Serialize)]
struct Dump {
    profiles: std::collections::HashMap<threadline_api::UserId, threadline_api::AuthorProfile>,
    comments: Vec<threadline_api::CommentRecord>,
}

fn main() -> Result<(), serde_json::Error> {
    let mut rng = rand::thread_rng();
    let comments = (0..NUM_POSTS)
        .flat_map(|i| {
            tests::gen_thread(
                &mut rng,
                &PostId(format!("post{i}")),
                NUM_COMMENTS_PER_POST,
            )
            .into_iter()
            .map(move |mut c| {
                // ids must stay unique across posts
                c.id.0 = format!("p{i}-{}", c.id);
                c.parent_id = c.parent_id.map(|p| threadline_api::CommentId(format!("p{i}-{p}")));
                c
            })
        })
        .collect();
    let dump = Dump {
        profiles: tests::gen_profiles(),
        comments,
    };
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
