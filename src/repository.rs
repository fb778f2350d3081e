//! Persistence contract for documents, text blocks, reviews and items.
//!
//! The pipeline persists every stage transition through [`ReviewRepository`]
//! so a crash mid-review leaves an inspectable record. The host application
//! supplies the real implementation (usually a SQL database);
//! [`InMemoryRepository`] backs the CLI and the test suite.
//!
//! The repository does not serialise concurrent reviews of one document:
//! two reviews racing on the same document each replace blocks and items
//! wholesale, so the last writer wins.

use crate::error::ReviewError;
use crate::model::{Document, RecordId, Review, ReviewItem, TextBlock};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Insert a new document and return it with its assigned id.
    async fn create_document(&self, document: Document) -> Result<Document, ReviewError>;

    /// Overwrite an existing document.
    async fn update_document(&self, document: &Document) -> Result<(), ReviewError>;

    /// Fails with [`ReviewError::NotFound`] for unknown ids.
    async fn find_document(&self, id: RecordId) -> Result<Document, ReviewError>;

    /// Delete all blocks of `document_id` and insert `blocks` in their place.
    async fn replace_text_blocks(
        &self,
        document_id: RecordId,
        blocks: Vec<TextBlock>,
    ) -> Result<(), ReviewError>;

    /// Blocks ordered by page, then block index.
    async fn find_text_blocks(&self, document_id: RecordId) -> Result<Vec<TextBlock>, ReviewError>;

    /// Insert a review, replacing any earlier review of the same document.
    async fn create_review(&self, review: Review) -> Result<Review, ReviewError>;

    /// Delete all items of `review_id` and insert `items` in their place.
    /// Items of a review that was already superseded by a newer review of
    /// the same document are discarded without error, so a losing
    /// concurrent run still completes.
    async fn replace_review_items(
        &self,
        review_id: RecordId,
        items: Vec<ReviewItem>,
    ) -> Result<(), ReviewError>;

    async fn find_review_items(&self, review_id: RecordId) -> Result<Vec<ReviewItem>, ReviewError>;
}

#[derive(Default)]
struct Tables {
    next_id: RecordId,
    documents: HashMap<RecordId, Document>,
    blocks: HashMap<RecordId, Vec<TextBlock>>,
    reviews: HashMap<RecordId, Review>,
    items: HashMap<RecordId, Vec<ReviewItem>>,
}

impl Tables {
    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

/// A process-local repository guarded by a single mutex.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current review of a document, if any.
    pub fn review_for_document(&self, document_id: RecordId) -> Option<Review> {
        self.lock()
            .ok()?
            .reviews
            .values()
            .find(|r| r.document_id == document_id)
            .cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, ReviewError> {
        self.tables
            .lock()
            .map_err(|_| ReviewError::Repository("in-memory repository lock poisoned".into()))
    }
}

#[async_trait]
impl ReviewRepository for InMemoryRepository {
    async fn create_document(&self, mut document: Document) -> Result<Document, ReviewError> {
        let mut t = self.lock()?;
        document.id = t.next_id();
        t.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn update_document(&self, document: &Document) -> Result<(), ReviewError> {
        let mut t = self.lock()?;
        let slot = t
            .documents
            .get_mut(&document.id)
            .ok_or_else(|| ReviewError::NotFound(format!("document {}", document.id)))?;
        *slot = document.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn find_document(&self, id: RecordId) -> Result<Document, ReviewError> {
        self.lock()?
            .documents
            .get(&id)
            .cloned()
            .ok_or_else(|| ReviewError::NotFound(format!("document {id}")))
    }

    async fn replace_text_blocks(
        &self,
        document_id: RecordId,
        mut blocks: Vec<TextBlock>,
    ) -> Result<(), ReviewError> {
        for b in &mut blocks {
            b.document_id = document_id;
        }
        blocks.sort_by_key(|b| (b.page_number, b.block_index));
        if blocks
            .windows(2)
            .any(|w| (w[0].page_number, w[0].block_index) == (w[1].page_number, w[1].block_index))
        {
            return Err(ReviewError::Repository(format!(
                "duplicate (page, block) in blocks of document {document_id}"
            )));
        }
        self.lock()?.blocks.insert(document_id, blocks);
        Ok(())
    }

    async fn find_text_blocks(&self, document_id: RecordId) -> Result<Vec<TextBlock>, ReviewError> {
        Ok(self
            .lock()?
            .blocks
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_review(&self, mut review: Review) -> Result<Review, ReviewError> {
        let mut t = self.lock()?;
        let stale: Vec<RecordId> = t
            .reviews
            .values()
            .filter(|r| r.document_id == review.document_id)
            .map(|r| r.id)
            .collect();
        for id in stale {
            t.reviews.remove(&id);
            t.items.remove(&id);
        }
        review.id = t.next_id();
        t.reviews.insert(review.id, review.clone());
        Ok(review)
    }

    async fn replace_review_items(
        &self,
        review_id: RecordId,
        mut items: Vec<ReviewItem>,
    ) -> Result<(), ReviewError> {
        let mut t = self.lock()?;
        if !t.reviews.contains_key(&review_id) {
            debug!(
                "Discarding {} items of superseded review {}",
                items.len(),
                review_id
            );
            return Ok(());
        }
        for item in &mut items {
            item.review_id = review_id;
        }
        t.items.insert(review_id, items);
        Ok(())
    }

    async fn find_review_items(&self, review_id: RecordId) -> Result<Vec<ReviewItem>, ReviewError> {
        Ok(self
            .lock()?
            .items
            .get(&review_id)
            .cloned()
            .unwrap_or_default())
    }
}
