//! Decoding of Reddit's polymorphic "Thing" envelopes.
//!
//! Every API payload is a `{kind, data}` pair where `kind` selects the shape
//! of `data`. The envelope is parsed first with an opaque payload, then the
//! payload is decoded according to `kind`. Comment trees arrive as nested
//! Listings inside each comment's `replies` field and are reconstructed here
//! into an owned forest; `more` placeholders are never surfaced as entities,
//! only harvested into `more_children_ids`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use orangered_core::ParseError;

pub const KIND_LISTING: &str = "Listing";
pub const KIND_COMMENT: &str = "t1";
pub const KIND_ACCOUNT: &str = "t2";
pub const KIND_POST: &str = "t3";
pub const KIND_SUBREDDIT: &str = "t5";
pub const KIND_MORE: &str = "more";

/// The universal envelope. `data` stays opaque until `kind` is inspected.
#[derive(Debug, Clone, Deserialize)]
pub struct Thing {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    before: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MoreData {
    #[serde(default)]
    children: Vec<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    count: u64,
}

/// Reddit's `edited` field is `false` when unedited and an epoch-seconds
/// number when edited. Decoded by inspecting the JSON token, never by
/// boolean coercion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Edited {
    pub is_edited: bool,
    pub timestamp: Option<u64>,
}

impl<'de> Deserialize<'de> for Edited {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Timestamp(f64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(is_edited) => Edited {
                is_edited,
                timestamp: None,
            },
            Raw::Timestamp(secs) => Edited {
                is_edited: true,
                timestamp: Some(secs as u64),
            },
        })
    }
}

// Counters arrive as `42` or `42.0` depending on which backend served the
// request; anything non-numeric decodes to zero rather than failing the
// whole listing.
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().map(|n| n as i64).unwrap_or(0))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64).unwrap_or(0))
}

fn lenient_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64))
}

/// A link/self post (`t3`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "name")]
    pub fullname: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub score: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub ups: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub downs: i64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub num_comments: u64,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub over_18: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub stickied: bool,
    #[serde(default)]
    pub edited: Edited,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub media: Option<Value>,
}

/// A comment (`t1`) with its decoded reply forest.
///
/// `replies` holds the comments Reddit inlined; ids of truncated siblings
/// live in `more_children_ids` and can be expanded through `morechildren`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Comment {
    pub id: String,
    pub fullname: String,
    pub link_id: String,
    pub parent_id: String,
    pub subreddit: String,
    pub author: String,
    pub body: String,
    pub body_html: String,
    pub score: i64,
    pub ups: i64,
    pub downs: i64,
    pub gilded: u64,
    pub created_utc: f64,
    pub edited: Edited,
    pub distinguished: Option<String>,
    pub replies: Vec<Comment>,
    pub more_children_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommentData {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "name")]
    fullname: String,
    #[serde(default)]
    link_id: String,
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    body_html: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    score: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    ups: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    downs: i64,
    #[serde(default, deserialize_with = "lenient_u64")]
    gilded: u64,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    edited: Edited,
    #[serde(default)]
    distinguished: Option<String>,
    /// Either the empty string (no replies) or a Listing Thing.
    #[serde(default)]
    replies: Value,
}

/// A subreddit (`t5`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subreddit {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "name")]
    pub fullname: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub subscribers: u64,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub active_user_count: Option<u64>,
    #[serde(default)]
    pub public_description: String,
    #[serde(default, rename = "over18")]
    pub over_18: bool,
    #[serde(default)]
    pub created_utc: f64,
}

/// An account (`t2`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub link_karma: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub comment_karma: i64,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub is_gold: bool,
    #[serde(default)]
    pub is_mod: bool,
    #[serde(default)]
    pub verified: bool,
}

fn decode_data<T: DeserializeOwned>(
    thing: Thing,
    expected: &'static str,
    context: &'static str,
) -> Result<T, ParseError> {
    if thing.kind != expected {
        return Err(ParseError::UnexpectedKind {
            expected,
            got: thing.kind,
        });
    }
    serde_json::from_value(thing.data).map_err(|source| ParseError::Json { context, source })
}

pub(crate) fn decode_account(thing: Thing) -> Result<Account, ParseError> {
    decode_data(thing, KIND_ACCOUNT, "account")
}

pub(crate) fn decode_subreddit(thing: Thing) -> Result<Subreddit, ParseError> {
    decode_data(thing, KIND_SUBREDDIT, "subreddit")
}

/// Flatten a post Listing into its `t3` entities, in listing order, plus the
/// pagination cursors. Children of any other kind are reported and skipped.
pub(crate) fn extract_posts(
    thing: Thing,
) -> Result<(Vec<Post>, Option<String>, Option<String>), ParseError> {
    let listing: ListingData = decode_data(thing, KIND_LISTING, "post listing")?;
    let mut posts = Vec::with_capacity(listing.children.len());
    for child in listing.children {
        match child.kind.as_str() {
            KIND_POST => posts.push(
                serde_json::from_value(child.data).map_err(|source| ParseError::Json {
                    context: "post",
                    source,
                })?,
            ),
            other => warn!(kind = other, "skipping unexpected thing in post listing"),
        }
    }
    Ok((posts, listing.after, listing.before))
}

/// Decode a comment Listing into an ordered forest plus the ids harvested
/// from `more` placeholders at this level.
pub(crate) fn decode_comment_listing(thing: Thing) -> Result<(Vec<Comment>, Vec<String>), ParseError> {
    let listing: ListingData = decode_data(thing, KIND_LISTING, "comment listing")?;
    let mut comments = Vec::new();
    let mut more_ids = Vec::new();
    for child in listing.children {
        match child.kind.as_str() {
            KIND_COMMENT => comments.push(decode_comment(child.data)?),
            KIND_MORE => more_ids.extend(decode_more(child.data)?),
            other => warn!(kind = other, "skipping unknown thing kind in comment listing"),
        }
    }
    Ok((comments, more_ids))
}

fn decode_comment(data: Value) -> Result<Comment, ParseError> {
    let raw: CommentData = serde_json::from_value(data).map_err(|source| ParseError::Json {
        context: "comment",
        source,
    })?;
    // `replies` is `""` for leaf comments and a Listing Thing otherwise.
    let (replies, more_children_ids) = match raw.replies {
        Value::Null | Value::String(_) => (Vec::new(), Vec::new()),
        value => {
            let thing: Thing =
                serde_json::from_value(value).map_err(|source| ParseError::Json {
                    context: "comment replies",
                    source,
                })?;
            decode_comment_listing(thing)?
        }
    };
    Ok(Comment {
        id: raw.id,
        fullname: raw.fullname,
        link_id: raw.link_id,
        parent_id: raw.parent_id,
        subreddit: raw.subreddit,
        author: raw.author,
        body: raw.body,
        body_html: raw.body_html,
        score: raw.score,
        ups: raw.ups,
        downs: raw.downs,
        gilded: raw.gilded,
        created_utc: raw.created_utc,
        edited: raw.edited,
        distinguished: raw.distinguished,
        replies,
        more_children_ids,
    })
}

fn decode_more(data: Value) -> Result<Vec<String>, ParseError> {
    let more: MoreData = serde_json::from_value(data).map_err(|source| ParseError::Json {
        context: "more placeholder",
        source,
    })?;
    if more.children.is_empty() && more.count > 0 {
        // Continued-thread form: nothing to expand without a parent fullname.
        debug!(count = more.count, "more placeholder carried no ids");
    }
    Ok(more.children)
}

/// Assemble the `/comments/{id}` response: a two-element array where the
/// first Listing holds the post and the second holds the comment forest.
pub(crate) fn decode_comments_pair(
    things: Vec<Thing>,
) -> Result<(Post, Vec<Comment>, Vec<String>), ParseError> {
    let [post_thing, comments_thing]: [Thing; 2] =
        things
            .try_into()
            .map_err(|v: Vec<Thing>| ParseError::MalformedThing {
                reason: format!("expected 2 listings in comments response, got {}", v.len()),
            })?;
    let (mut posts, _, _) = extract_posts(post_thing)?;
    if posts.is_empty() {
        return Err(ParseError::MalformedThing {
            reason: "comments response carried no post".to_string(),
        });
    }
    let post = posts.swap_remove(0);
    let (comments, more_ids) = decode_comment_listing(comments_thing)?;
    Ok((post, comments, more_ids))
}

/// Decode the flat `things` array of a `morechildren` response. Comments
/// keep listing order; ids from nested `more` entries are collected rather
/// than dropped.
pub(crate) fn decode_more_children(
    things: Vec<Thing>,
) -> Result<(Vec<Comment>, Vec<String>), ParseError> {
    let mut comments = Vec::new();
    let mut more_ids = Vec::new();
    for thing in things {
        match thing.kind.as_str() {
            KIND_COMMENT => comments.push(decode_comment(thing.data)?),
            KIND_MORE => more_ids.extend(decode_more(thing.data)?),
            other => warn!(kind = other, "skipping unknown thing kind in morechildren response"),
        }
    }
    Ok((comments, more_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thing(value: Value) -> Thing {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn edited_decodes_false_and_timestamp() {
        let edited: Edited = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(edited, Edited { is_edited: false, timestamp: None });

        let edited: Edited = serde_json::from_value(json!(1234567890)).unwrap();
        assert_eq!(edited, Edited { is_edited: true, timestamp: Some(1234567890) });

        let edited: Edited = serde_json::from_value(json!(1234567890.5)).unwrap();
        assert_eq!(edited.timestamp, Some(1234567890));
    }

    #[test]
    fn counters_accept_integer_and_fractional_zero() {
        let post: Post = serde_json::from_value(json!({
            "id": "abc",
            "score": 42.0,
            "ups": 45,
            "num_comments": 7.0
        }))
        .unwrap();
        assert_eq!(post.score, 42);
        assert_eq!(post.ups, 45);
        assert_eq!(post.num_comments, 7);
        assert_eq!(post.downs, 0);
    }

    #[test]
    fn extract_posts_preserves_order_and_cursors() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {
                "after": "t3_poste",
                "before": null,
                "children": [
                    {"kind": "t3", "data": {"id": "posta", "score": 110}},
                    {"kind": "t3", "data": {"id": "postb", "score": 120}}
                ]
            }
        }));
        let (posts, after, before) = extract_posts(listing).unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, "posta");
        assert_eq!(posts[0].score, 110);
        assert_eq!(posts[1].id, "postb");
        assert_eq!(posts[1].score, 120);
        assert_eq!(after.as_deref(), Some("t3_poste"));
        assert_eq!(before, None);
    }

    #[test]
    fn extract_posts_empty_listing_keeps_cursors() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {"after": "t3_x", "before": "", "children": []}
        }));
        let (posts, after, before) = extract_posts(listing).unwrap();
        assert!(posts.is_empty());
        assert_eq!(after.as_deref(), Some("t3_x"));
        assert_eq!(before.as_deref(), Some(""));
    }

    #[test]
    fn extract_posts_skips_unknown_kinds() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {
                "children": [
                    {"kind": "t3", "data": {"id": "keep"}},
                    {"kind": "t9", "data": {"id": "skip"}},
                    {"kind": "t1", "data": {"id": "alsoskip"}}
                ]
            }
        }));
        let (posts, _, _) = extract_posts(listing).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "keep");
    }

    #[test]
    fn extract_posts_rejects_non_listing() {
        let not_listing = thing(json!({"kind": "t3", "data": {}}));
        assert!(matches!(
            extract_posts(not_listing),
            Err(ParseError::UnexpectedKind { expected: "Listing", .. })
        ));
    }

    #[test]
    fn comment_tree_collects_replies_and_more_ids() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {
                "children": [{
                    "kind": "t1",
                    "data": {
                        "id": "c1",
                        "name": "t1_c1",
                        "parent_id": "t3_post1",
                        "link_id": "t3_post1",
                        "body": "top",
                        "replies": {
                            "kind": "Listing",
                            "data": {
                                "children": [
                                    {"kind": "t1", "data": {
                                        "id": "c2",
                                        "parent_id": "t1_c1",
                                        "link_id": "t3_post1",
                                        "body": "child",
                                        "replies": ""
                                    }},
                                    {"kind": "more", "data": {
                                        "count": 3,
                                        "children": ["c3", "c4", "c5"]
                                    }}
                                ]
                            }
                        }
                    }
                }]
            }
        }));
        let (comments, more_ids) = decode_comment_listing(listing).unwrap();
        assert!(more_ids.is_empty());
        assert_eq!(comments.len(), 1);
        let c1 = &comments[0];
        assert_eq!(c1.id, "c1");
        assert_eq!(c1.replies.len(), 1);
        assert_eq!(c1.replies[0].id, "c2");
        assert!(c1.replies[0].replies.is_empty());
        assert_eq!(c1.more_children_ids, ["c3", "c4", "c5"]);
    }

    #[test]
    fn top_level_more_ids_are_harvested() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {
                "children": [
                    {"kind": "t1", "data": {"id": "c1", "replies": ""}},
                    {"kind": "more", "data": {"count": 2, "children": ["x1", "x2"]}}
                ]
            }
        }));
        let (comments, more_ids) = decode_comment_listing(listing).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(more_ids, ["x1", "x2"]);
    }

    #[test]
    fn continued_thread_more_yields_no_ids() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {
                "children": [
                    {"kind": "more", "data": {"count": 12, "children": []}}
                ]
            }
        }));
        let (comments, more_ids) = decode_comment_listing(listing).unwrap();
        assert!(comments.is_empty());
        assert!(more_ids.is_empty());
    }

    #[test]
    fn comments_pair_assembles_post_and_forest() {
        let things = vec![
            thing(json!({
                "kind": "Listing",
                "data": {"children": [{"kind": "t3", "data": {"id": "post1", "name": "t3_post1"}}]}
            })),
            thing(json!({
                "kind": "Listing",
                "data": {"children": [
                    {"kind": "t1", "data": {"id": "c1", "parent_id": "t3_post1", "replies": ""}},
                    {"kind": "more", "data": {"count": 1, "children": ["c9"]}}
                ]}
            })),
        ];
        let (post, comments, more_ids) = decode_comments_pair(things).unwrap();
        assert_eq!(post.id, "post1");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].parent_id, "t3_post1");
        assert_eq!(more_ids, ["c9"]);
    }

    #[test]
    fn comments_pair_rejects_wrong_arity() {
        let things = vec![thing(json!({"kind": "Listing", "data": {"children": []}}))];
        assert!(matches!(
            decode_comments_pair(things),
            Err(ParseError::MalformedThing { .. })
        ));
    }

    #[test]
    fn every_parent_is_in_tree_or_in_more_ids() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {
                "children": [{
                    "kind": "t1",
                    "data": {
                        "id": "a", "name": "t1_a", "parent_id": "t3_p", "link_id": "t3_p",
                        "replies": {"kind": "Listing", "data": {"children": [
                            {"kind": "t1", "data": {"id": "b", "name": "t1_b", "parent_id": "t1_a", "link_id": "t3_p", "replies": ""}},
                            {"kind": "more", "data": {"children": ["c", "d"]}}
                        ]}}
                    }
                }]
            }
        }));
        let (comments, _) = decode_comment_listing(listing).unwrap();

        let mut ids = Vec::new();
        let mut more = Vec::new();
        fn walk(comments: &[Comment], ids: &mut Vec<String>, more: &mut Vec<String>) {
            for c in comments {
                ids.push(c.id.clone());
                more.extend(c.more_children_ids.iter().cloned());
                walk(&c.replies, ids, more);
            }
        }
        walk(&comments, &mut ids, &mut more);

        for c in &comments {
            for reply in &c.replies {
                let parent = reply.parent_id.trim_start_matches("t1_");
                assert!(ids.contains(&parent.to_string()) || more.contains(&parent.to_string()));
            }
        }
        // Each comment appears exactly once.
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
    }

    #[test]
    fn more_children_response_decodes_flat() {
        let things = vec![
            thing(json!({"kind": "t1", "data": {"id": "c3", "parent_id": "t1_c1", "replies": ""}})),
            thing(json!({"kind": "t1", "data": {"id": "c4", "parent_id": "t1_c1", "replies": ""}})),
            thing(json!({"kind": "more", "data": {"children": ["c5"]}})),
        ];
        let (comments, more_ids) = decode_more_children(things).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].id, "c3");
        assert_eq!(comments[1].id, "c4");
        assert_eq!(more_ids, ["c5"]);
    }

    #[test]
    fn account_and_subreddit_decode() {
        let account = decode_account(thing(json!({
            "kind": "t2",
            "data": {
                "id": "abc",
                "name": "spez",
                "link_karma": 1000,
                "comment_karma": 2000.0,
                "created_utc": 1118030400.0,
                "is_gold": true,
                "is_mod": true,
                "verified": true
            }
        })))
        .unwrap();
        assert_eq!(account.name, "spez");
        assert_eq!(account.comment_karma, 2000);
        assert!(account.is_gold);

        let sub = decode_subreddit(thing(json!({
            "kind": "t5",
            "data": {
                "display_name": "rust",
                "subscribers": 300000,
                "active_user_count": 1200,
                "public_description": "The Rust programming language",
                "over18": false,
                "created_utc": 1201242956.0
            }
        })))
        .unwrap();
        assert_eq!(sub.display_name, "rust");
        assert_eq!(sub.subscribers, 300000);
        assert_eq!(sub.active_user_count, Some(1200));
        assert!(!sub.over_18);
    }

    #[test]
    fn wrong_kind_at_top_level_is_an_error() {
        let result = decode_account(thing(json!({"kind": "t5", "data": {}})));
        assert!(matches!(
            result,
            Err(ParseError::UnexpectedKind { expected: "t2", got }) if got == "t5"
        ));
    }

    #[test]
    fn reencoded_posts_preserve_key_fields() {
        let listing = thing(json!({
            "kind": "Listing",
            "data": {"children": [{"kind": "t3", "data": {
                "id": "abc",
                "name": "t3_abc",
                "title": "A title",
                "score": 99,
                "created_utc": 1700000000.0,
                "permalink": "/r/rust/comments/abc/a_title/",
                "author": "someone"
            }}]}
        }));
        let (posts, _, _) = extract_posts(listing).unwrap();
        let encoded = serde_json::to_value(&posts[0]).unwrap();
        assert_eq!(encoded["id"], "abc");
        assert_eq!(encoded["title"], "A title");
        assert_eq!(encoded["score"], 99);
        assert_eq!(encoded["created_utc"], 1700000000.0);
        assert_eq!(encoded["permalink"], "/r/rust/comments/abc/a_title/");
        assert_eq!(encoded["author"], "someone");
    }
}
