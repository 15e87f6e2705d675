// src/collab/memory.rs

//! In-memory record store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::collab::{CollabError, Store};
use crate::model::{ImageRecord, ImageRef, Manifest, Wish, WishSpec};

#[derive(Debug, Default)]
struct Records {
    next_wish_id: u64,
    next_image_id: u64,
    wishes: BTreeMap<u64, Wish>,
    images: BTreeMap<u64, ImageRecord>,
    image_ids: HashMap<ImageRef, u64>,
    links: BTreeSet<(u64, u64)>,
    manifests: HashMap<u64, Manifest>,
}

/// [`Store`] keeping everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn wishes(&self) -> Result<Vec<Wish>, CollabError> {
        Ok(self.lock().wishes.values().cloned().collect())
    }

    fn wish(&self, id: u64) -> Result<Option<Wish>, CollabError> {
        Ok(self.lock().wishes.get(&id).cloned())
    }

    fn upsert_wish(&self, spec: WishSpec) -> Result<Wish, CollabError> {
        let mut records = self.lock();
        if let Some(existing) = records
            .wishes
            .values()
            .find(|w| w.cvmfs_repo == spec.cvmfs_repo && w.input == spec.input)
        {
            return Ok(existing.clone());
        }

        records.next_wish_id += 1;
        let wish = Wish {
            id: records.next_wish_id,
            cvmfs_repo: spec.cvmfs_repo,
            input_uri: spec.input_uri,
            input: spec.input,
        };
        records.wishes.insert(wish.id, wish.clone());
        Ok(wish)
    }

    fn upsert_image(&self, image: &ImageRef) -> Result<ImageRecord, CollabError> {
        let mut records = self.lock();
        if let Some(id) = records.image_ids.get(image).copied() {
            return records
                .images
                .get(&id)
                .cloned()
                .ok_or_else(|| CollabError::Other(format!("image index out of sync for {image}")));
        }

        records.next_image_id += 1;
        let record = ImageRecord {
            id: records.next_image_id,
            image: image.clone(),
        };
        records.image_ids.insert(image.clone(), record.id);
        records.images.insert(record.id, record.clone());
        Ok(record)
    }

    fn images_for_wish(&self, wish_id: u64) -> Result<Vec<ImageRecord>, CollabError> {
        let records = self.lock();
        Ok(records
            .links
            .iter()
            .filter(|(w, _)| *w == wish_id)
            .filter_map(|(_, image_id)| records.images.get(image_id).cloned())
            .collect())
    }

    fn link_image(&self, wish_id: u64, image_id: u64) -> Result<(), CollabError> {
        let mut records = self.lock();
        if !records.wishes.contains_key(&wish_id) {
            return Err(CollabError::NotFound(format!("wish {wish_id}")));
        }
        if !records.images.contains_key(&image_id) {
            return Err(CollabError::NotFound(format!("image {image_id}")));
        }
        records.links.insert((wish_id, image_id));
        Ok(())
    }

    fn unlink_image(&self, wish_id: u64, image_id: u64) -> Result<(), CollabError> {
        self.lock().links.remove(&(wish_id, image_id));
        Ok(())
    }

    fn set_manifest(&self, image_id: u64, manifest: &Manifest) -> Result<(), CollabError> {
        let mut records = self.lock();
        if !records.images.contains_key(&image_id) {
            return Err(CollabError::NotFound(format!("image {image_id}")));
        }
        records.manifests.insert(image_id, manifest.clone());
        Ok(())
    }

    fn manifest(&self, image_id: u64) -> Result<Option<Manifest>, CollabError> {
        Ok(self.lock().manifests.get(&image_id).cloned())
    }
}
