//! Blog schema shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_orm::{
    ConnectionPool, DatabaseConfig, FieldDescriptor, MigrationHistory, MigrationRunner, Model,
    ModelDescriptor, OnDelete, SchemaRegistry,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Option<i64>,
    pub username: String,
    pub email: Option<String>,
}

impl Model for User {
    const NAME: &'static str = "User";

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("User", "users")
            .field(FieldDescriptor::id())
            .field(FieldDescriptor::text("username").unique())
            .field(FieldDescriptor::text("email").nullable())
            .reverse("posts", "Post", "author")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Option<i64>,
    pub name: String,
}

impl Model for Tag {
    const NAME: &'static str = "Tag";

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("Tag", "tags")
            .field(FieldDescriptor::id())
            .field(FieldDescriptor::text("name").unique())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Option<i64>,
    pub title: String,
    pub views: i64,
    pub published: bool,
    pub author_id: Option<i64>,
}

impl Model for Post {
    const NAME: &'static str = "Post";

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("Post", "posts")
            .field(FieldDescriptor::id())
            .field(FieldDescriptor::text("title"))
            .field(FieldDescriptor::integer("views").default(0))
            .field(FieldDescriptor::boolean("published").default(false))
            .foreign_key("author", "User", OnDelete::Cascade)
            .many_to_many("tags", "Tag", "PostTag")
            .reverse("comments", "Comment", "post")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Option<i64>,
    pub body: String,
    pub post_id: Option<i64>,
}

impl Model for Comment {
    const NAME: &'static str = "Comment";

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("Comment", "comments")
            .field(FieldDescriptor::id())
            .field(FieldDescriptor::text("body"))
            .foreign_key("post", "Post", OnDelete::Restrict)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTag {
    pub id: Option<i64>,
    pub post_id: Option<i64>,
    pub tag_id: Option<i64>,
}

impl Model for PostTag {
    const NAME: &'static str = "PostTag";

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("PostTag", "post_tags")
            .field(FieldDescriptor::id())
            .foreign_key("post", "Post", OnDelete::Cascade)
            .foreign_key("tag", "Tag", OnDelete::Cascade)
            .unique_together(&["post", "tag"])
    }
}

pub fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register_model::<User>().unwrap();
    registry.register_model::<Tag>().unwrap();
    registry.register_model::<Post>().unwrap();
    registry.register_model::<Comment>().unwrap();
    registry.register_model::<PostTag>().unwrap();
    registry.finalize().unwrap();
    Arc::new(registry)
}

/// Fresh in-memory store with the blog schema migrated in
pub async fn migrated(name: &str) -> (ConnectionPool, Arc<SchemaRegistry>) {
    let registry = registry();
    let pool = ConnectionPool::connect(&DatabaseConfig::new(format!("memory://{}", name))).unwrap();

    let mut history = MigrationHistory::new(Vec::new()).unwrap();
    let initial = history.make_migration(&registry).unwrap().unwrap();
    history.push(initial).unwrap();
    MigrationRunner::new(pool.clone()).apply(&history).await.unwrap();

    (pool, registry)
}
