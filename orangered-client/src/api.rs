//! Endpoint methods and the bounded batch fan-out.
//!
//! Every method validates its inputs first, so bad arguments fail with a
//! `ConfigError` before the limiter or the wire are touched. Query
//! parameters are emitted only when non-zero/non-empty.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use orangered_core::validate;
use orangered_core::{Cancelled, ConfigError, Error, RequestError};

use crate::things::{self, Account, Comment, Post, Subreddit};
use crate::Reddit;

/// Upper bound on requests in one `comments_multiple` call.
const MAX_BATCH_REQUESTS: usize = 100;

/// Worker-pool width for `comments_multiple`.
const MAX_BATCH_WORKERS: usize = 10;

/// Pagination options for listing endpoints. A zero `limit` and empty
/// cursors mean "server defaults" and are omitted from the query string.
#[derive(Debug, Clone, Default)]
pub struct ListingOptions {
    pub limit: u32,
    pub after: Option<String>,
    pub before: Option<String>,
}

/// One page of posts plus the cursors to continue from.
#[derive(Debug, Clone, Default)]
pub struct PostsResponse {
    pub posts: Vec<Post>,
    pub after: Option<String>,
    pub before: Option<String>,
}

/// Parameters for a `comments` call. `post_id` accepts either `abc123` or
/// `t3_abc123`.
#[derive(Debug, Clone, Default)]
pub struct CommentsRequest {
    pub subreddit: String,
    pub post_id: String,
    pub limit: u32,
    pub sort: Option<String>,
}

/// A post with its decoded comment forest and the ids of truncated
/// top-level subtrees.
#[derive(Debug, Clone)]
pub struct CommentsResponse {
    pub post: Post,
    pub comments: Vec<Comment>,
    pub more_ids: Vec<String>,
}

/// Parameters for a `more_comments` call.
#[derive(Debug, Clone, Default)]
pub struct MoreChildrenRequest {
    pub link_id: String,
    pub comment_ids: Vec<String>,
    pub sort: Option<String>,
    pub depth: Option<u32>,
    pub limit_children: bool,
}

/// The flat expansion of truncated comment subtrees.
#[derive(Debug, Clone, Default)]
pub struct MoreChildrenResponse {
    pub comments: Vec<Comment>,
    pub more_ids: Vec<String>,
}

/// Outcome of a `comments_multiple` call: responses at their input
/// positions, plus the first failure (by arrival) when any occurred.
#[derive(Debug, Default)]
pub struct CommentsBatch {
    pub responses: Vec<Option<CommentsResponse>>,
    pub first_error: Option<Error>,
}

impl Reddit {
    /// GET `api/v1/me`: the account the client is authenticated as.
    pub async fn me(&self) -> Result<Account, Error> {
        let token = self.inner.auth.bearer_token().await?;
        let thing = self
            .inner
            .pipeline
            .get_thing("me", "api/v1/me", &[], &token)
            .await?;
        Ok(things::decode_account(thing)?)
    }

    /// GET `r/{name}/about`.
    pub async fn subreddit_about(&self, name: &str) -> Result<Subreddit, Error> {
        validate::subreddit_name(name)?;
        let token = self.inner.auth.bearer_token().await?;
        let path = format!("r/{name}/about");
        let thing = self
            .inner
            .pipeline
            .get_thing("subreddit_about", &path, &[], &token)
            .await?;
        Ok(things::decode_subreddit(thing)?)
    }

    /// GET `r/{subreddit}/hot`, or the front page when `subreddit` is empty.
    pub async fn hot(
        &self,
        subreddit: &str,
        options: &ListingOptions,
    ) -> Result<PostsResponse, Error> {
        self.listing("hot", subreddit, options).await
    }

    /// GET `r/{subreddit}/new`, or the front page when `subreddit` is empty.
    pub async fn new(
        &self,
        subreddit: &str,
        options: &ListingOptions,
    ) -> Result<PostsResponse, Error> {
        self.listing("new", subreddit, options).await
    }

    async fn listing(
        &self,
        which: &'static str,
        subreddit: &str,
        options: &ListingOptions,
    ) -> Result<PostsResponse, Error> {
        if !subreddit.is_empty() {
            validate::subreddit_name(subreddit)?;
        }
        validate::pagination(
            options.limit,
            options.after.as_deref(),
            options.before.as_deref(),
        )?;

        let path = if subreddit.is_empty() {
            which.to_string()
        } else {
            format!("r/{subreddit}/{which}")
        };
        let mut query: Vec<(&str, String)> = Vec::new();
        if options.limit > 0 {
            query.push(("limit", options.limit.to_string()));
        }
        if let Some(after) = options.after.as_deref().filter(|s| !s.is_empty()) {
            query.push(("after", after.to_string()));
        }
        if let Some(before) = options.before.as_deref().filter(|s| !s.is_empty()) {
            query.push(("before", before.to_string()));
        }

        let token = self.inner.auth.bearer_token().await?;
        let thing = self
            .inner
            .pipeline
            .get_thing(which, &path, &query, &token)
            .await?;
        let (posts, after, before) = things::extract_posts(thing)?;
        Ok(PostsResponse {
            posts,
            after,
            before,
        })
    }

    /// GET `r/{sub}/comments/{post_id}`: the post, its comment forest, and
    /// the ids of any truncated top-level subtrees.
    pub async fn comments(&self, request: &CommentsRequest) -> Result<CommentsResponse, Error> {
        validate::subreddit_name(&request.subreddit)?;
        let link_id = validate::normalize_link_id(&request.post_id)?;
        validate::pagination(request.limit, None, None)?;
        let post_id = link_id.trim_start_matches("t3_");

        let path = format!("r/{}/comments/{}", request.subreddit, post_id);
        let mut query: Vec<(&str, String)> = Vec::new();
        if request.limit > 0 {
            query.push(("limit", request.limit.to_string()));
        }
        if let Some(sort) = request.sort.as_deref().filter(|s| !s.is_empty()) {
            query.push(("sort", sort.to_string()));
        }

        let token = self.inner.auth.bearer_token().await?;
        let things = self
            .inner
            .pipeline
            .get_thing_array("comments", &path, &query, &token)
            .await?;
        let (post, comments, more_ids) = things::decode_comments_pair(things)?;
        Ok(CommentsResponse {
            post,
            comments,
            more_ids,
        })
    }

    /// POST `api/morechildren`: expand up to 100 truncated comment ids into
    /// a flat list of comments.
    pub async fn more_comments(
        &self,
        request: &MoreChildrenRequest,
    ) -> Result<MoreChildrenResponse, Error> {
        let link_id = validate::normalize_link_id(&request.link_id)?;
        validate::comment_ids(&request.comment_ids)?;
        if request.comment_ids.is_empty() {
            return Ok(MoreChildrenResponse::default());
        }

        let mut form: Vec<(&str, String)> = vec![
            ("link_id", link_id),
            ("children", request.comment_ids.join(",")),
            ("api_type", "json".to_string()),
        ];
        if let Some(sort) = request.sort.as_deref().filter(|s| !s.is_empty()) {
            form.push(("sort", sort.to_string()));
        }
        if let Some(depth) = request.depth {
            form.push(("depth", depth.to_string()));
        }
        if request.limit_children {
            // Serialized as the literal string "true", never as a number.
            form.push(("limit_children", "true".to_string()));
        }

        let token = self.inner.auth.bearer_token().await?;
        let things = self
            .inner
            .pipeline
            .post_more_children("more_comments", "api/morechildren", &form, &token)
            .await?;
        let (comments, more_ids) = things::decode_more_children(things)?;
        Ok(MoreChildrenResponse { comments, more_ids })
    }

    /// Fetch many comment threads concurrently under a pool of at most ten
    /// workers. Results land at their input positions regardless of
    /// completion order.
    ///
    /// All requests are validated before any work starts; a validation
    /// failure is returned as `Err` with nothing dispatched. After that
    /// point the call always yields a [`CommentsBatch`]: on worker failure
    /// the first error (in arrival order) is recorded and the remaining
    /// responses are kept; on cancellation via `cancel`, dispatch stops,
    /// outstanding workers are aborted and drained, and the partial batch
    /// carries the cancellation as its error.
    pub async fn comments_multiple(
        &self,
        requests: &[CommentsRequest],
        cancel: &CancellationToken,
    ) -> Result<CommentsBatch, Error> {
        if requests.len() > MAX_BATCH_REQUESTS {
            return Err(ConfigError::TooManyRequests {
                count: requests.len(),
                max: MAX_BATCH_REQUESTS,
            }
            .into());
        }
        for request in requests {
            validate::subreddit_name(&request.subreddit)?;
            validate::normalize_link_id(&request.post_id)?;
            validate::pagination(request.limit, None, None)?;
        }

        let mut responses: Vec<Option<CommentsResponse>> = Vec::new();
        responses.resize_with(requests.len(), || None);
        if requests.is_empty() {
            return Ok(CommentsBatch {
                responses,
                first_error: None,
            });
        }

        let semaphore = Arc::new(Semaphore::new(MAX_BATCH_WORKERS));
        let (tx, mut rx) = mpsc::channel(requests.len());
        let mut workers = JoinSet::new();
        for (index, request) in requests.iter().cloned().enumerate() {
            let client = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    () = cancel.cancelled() => return,
                };
                let result = tokio::select! {
                    result = client.comments(&request) => result,
                    () = cancel.cancelled() => return,
                };
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut first_error: Option<Error> = None;
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some((index, Ok(response))) => responses[index] = Some(response),
                    Some((_, Err(error))) => {
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                    // Channel closed: every worker has finished.
                    None => break,
                },
                () = cancel.cancelled() => {
                    debug!("comments batch cancelled, draining workers");
                    workers.abort_all();
                    // Harvest results that raced ahead of the cancellation.
                    while let Ok((index, result)) = rx.try_recv() {
                        if let Ok(response) = result {
                            responses[index] = Some(response);
                        }
                    }
                    first_error = Some(
                        RequestError {
                            operation: "comments_multiple",
                            url: self.inner.pipeline.base_url().to_string(),
                            source: Box::new(Cancelled),
                        }
                        .into(),
                    );
                    break;
                }
            }
        }
        // No worker outlives the call.
        while workers.join_next().await.is_some() {}

        Ok(CommentsBatch {
            responses,
            first_error,
        })
    }
}
