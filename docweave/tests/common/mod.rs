#![allow(dead_code)]

use docweave::{memory::InMemoryStore, prelude::*};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    #[serde(rename = "_id")]
    pub id: EntityId,
    pub name: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<ModifiedBy>,
}

impl Author {
    pub fn new(name: &str) -> Self {
        Self { id: IdKind::Sequence.unset(), name: name.into(), active: true, modified_by: None }
    }
}

impl Entity for Author {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn id_kind() -> IdKind {
        IdKind::Sequence
    }

    fn type_name() -> &'static str {
        "Author"
    }

    fn set_modified_by(&mut self, modified_by: &ModifiedBy) {
        self.modified_by = Some(modified_by.clone());
    }

    fn modified_by_field() -> Option<&'static str> {
        Some("modified_by")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(rename = "_id")]
    pub id: EntityId,
    pub title: String,
    pub pages: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<One<Author>>,
}

impl Book {
    pub fn new(title: &str, pages: i32) -> Self {
        Self { id: EntityId::default(), title: title.into(), pages, tags: Vec::new(), author: None }
    }
}

impl Entity for Book {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn id_kind() -> IdKind {
        IdKind::ObjectId
    }

    fn type_name() -> &'static str {
        "Book"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reader {
    #[serde(rename = "_id")]
    pub id: EntityId,
    pub handle: String,
}

impl Reader {
    pub fn new(handle: &str) -> Self {
        Self { id: IdKind::Random.unset(), handle: handle.into() }
    }
}

impl Entity for Reader {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn id_kind() -> IdKind {
        IdKind::Random
    }

    fn type_name() -> &'static str {
        "Reader"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(rename = "_id")]
    pub id: EntityId,
    pub name: FuzzyString,
    pub deleted: bool,
}

impl Recipe {
    pub fn new(name: &str) -> Self {
        Self { id: IdKind::String.unset(), name: FuzzyString::new(name), deleted: false }
    }
}

impl Entity for Recipe {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn id_kind() -> IdKind {
        IdKind::String
    }

    fn type_name() -> &'static str {
        "Recipe"
    }
}

pub fn schema() -> Schema {
    Schema::builder()
        .entity::<Author>(|c| c.collection("authors"))
        .entity::<Book>(|c| c.collection("books"))
        .entity::<Reader>(|c| c.collection("readers"))
        .entity::<Recipe>(|c| c.collection("recipes").tag("soft_delete"))
        .one_to_many::<Author, Book>("books")
        .many_to_many::<Book, Reader>("readers", "books_read")
        .build()
        .unwrap()
}

pub fn context() -> Context {
    Context::builder(InMemoryStore::new()).schema(schema()).build()
}

pub fn titles(books: &[Book]) -> Vec<&str> {
    books.iter().map(|book| book.title.as_str()).collect()
}
