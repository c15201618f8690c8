use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub cover_image: Option<String>,
    pub tags: Vec<String>,
    pub read_time: i64,
    pub premium_only: bool,
    pub early_access: bool,
    pub trending: bool,
    pub trending_position: Option<i64>,
    pub trending_until: Option<String>,
    pub likes: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub parent_id: Option<String>,
    pub body: String,
    pub likes: i64,
    pub highlighted: bool,
    pub pinned: bool,
    pub edited: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bulletin {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub body: String,
    pub mood: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room: String,
    pub user_id: String,
    pub body: String,
    /// Emoji -> list of user ids who reacted with it.
    pub reactions: std::collections::BTreeMap<String, Vec<String>>,
    pub edited: bool,
    pub created_at: String,
}
