use lopdf::{Document, Object, ObjectId};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Errors from the merge engine.
///
/// Every variant aborts the whole batch; there is no partial output.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Merging zero documents is a deterministic failure, never an empty
    /// output document
    #[error("no input documents to merge")]
    EmptyBatch,

    /// One input could not be parsed as a PDF; the batch is abandoned
    #[error("input document {index} is unreadable: {source}")]
    UnreadableInput {
        index: usize,
        #[source]
        source: lopdf::Error,
    },

    /// The combined object set lacks a mandatory structural object
    #[error("merged document has no {0} object")]
    MissingStructure(&'static str),

    /// Writing the merged document failed
    #[error("failed to serialize merged document: {0}")]
    Serialize(lopdf::Error),
}

/// Concatenate the pages of the given documents, in order, into one PDF.
///
/// Inputs are raw PDF bytes in merge order; the order is never changed here.
/// The function is pure: it does not touch storage and byte-level output
/// determinism is only guaranteed up to page content and order.
pub fn merge_documents(inputs: &[Vec<u8>]) -> Result<Vec<u8>, MergeError> {
    if inputs.is_empty() {
        return Err(MergeError::EmptyBatch);
    }

    // Renumber every document into one shared object-id space, collecting
    // page objects separately so they can be rewired under a single Pages
    // tree afterwards.
    let mut max_id = 1;
    let mut all_pages: BTreeMap<ObjectId, Object> = BTreeMap::new();
    let mut all_objects: BTreeMap<ObjectId, Object> = BTreeMap::new();
    let mut merged = Document::with_version("1.5");

    for (index, bytes) in inputs.iter().enumerate() {
        let mut doc = Document::load_mem(bytes)
            .map_err(|source| MergeError::UnreadableInput { index, source })?;

        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;

        for (_, object_id) in doc.get_pages() {
            let object = doc
                .get_object(object_id)
                .map_err(|source| MergeError::UnreadableInput { index, source })?
                .to_owned();
            all_pages.insert(object_id, object);
        }

        all_objects.extend(doc.objects);
    }

    // Fold every document's Catalog and Pages into one of each; pages are
    // inserted later with a corrected parent, outlines are dropped.
    let mut catalog: Option<(ObjectId, Object)> = None;
    let mut pages: Option<(ObjectId, Object)> = None;

    for (object_id, object) in all_objects.iter() {
        match object.type_name().unwrap_or(b"") {
            b"Catalog" => {
                catalog = Some((
                    catalog.map(|(id, _)| id).unwrap_or(*object_id),
                    object.clone(),
                ));
            }
            b"Pages" => {
                if let Ok(dictionary) = object.as_dict() {
                    let mut dictionary = dictionary.clone();
                    if let Some((_, ref existing)) = pages {
                        if let Ok(existing_dict) = existing.as_dict() {
                            dictionary.extend(existing_dict);
                        }
                    }
                    pages = Some((
                        pages.map(|(id, _)| id).unwrap_or(*object_id),
                        Object::Dictionary(dictionary),
                    ));
                }
            }
            b"Page" | b"Outlines" | b"Outline" => {}
            _ => {
                merged.objects.insert(*object_id, object.clone());
            }
        }
    }

    let (pages_id, pages_object) = pages.ok_or(MergeError::MissingStructure("Pages"))?;
    let (catalog_id, catalog_object) = catalog.ok_or(MergeError::MissingStructure("Catalog"))?;

    // Reparent every page under the single surviving Pages node
    for (object_id, object) in all_pages.iter() {
        if let Ok(dictionary) = object.as_dict() {
            let mut dictionary = dictionary.clone();
            dictionary.set("Parent", pages_id);
            merged
                .objects
                .insert(*object_id, Object::Dictionary(dictionary));
        }
    }

    if let Ok(dictionary) = pages_object.as_dict() {
        let mut dictionary = dictionary.clone();
        dictionary.set("Count", all_pages.len() as u32);
        dictionary.set(
            "Kids",
            all_pages
                .keys()
                .map(|id| Object::Reference(*id))
                .collect::<Vec<_>>(),
        );
        merged
            .objects
            .insert(pages_id, Object::Dictionary(dictionary));
    }

    if let Ok(dictionary) = catalog_object.as_dict() {
        let mut dictionary = dictionary.clone();
        dictionary.set("Pages", pages_id);
        dictionary.remove(b"Outlines");
        merged
            .objects
            .insert(catalog_id, Object::Dictionary(dictionary));
    }

    merged.trailer.set("Root", catalog_id);

    // max_id drifted during the direct object inserts above
    merged.max_id = merged.objects.len() as u32;
    merged.renumber_objects();
    merged.compress();

    let mut output = Vec::new();
    merged
        .save_to(&mut output)
        .map_err(|e| MergeError::Serialize(e.into()))?;

    debug!(
        input_count = inputs.len(),
        page_count = all_pages.len(),
        output_bytes = output.len(),
        "Documents merged"
    );

    Ok(output)
}

/// Build a minimal one-page PDF containing the given text (test fixture)
#[cfg(test)]
pub(crate) fn one_page_pdf(text: &str) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![50.into(), 700.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    });

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
        "Resources" => resources_id,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_text(doc: &Document, page_num: u32) -> String {
        let pages = doc.get_pages();
        let page_id = pages[&page_num];
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let contents_id = page.get(b"Contents").unwrap().as_reference().unwrap();
        let stream = doc.get_object(contents_id).unwrap().as_stream().unwrap();
        let bytes = stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_empty_batch_is_a_deterministic_failure() {
        assert!(matches!(merge_documents(&[]), Err(MergeError::EmptyBatch)));
    }

    #[test]
    fn test_merge_concatenates_all_pages_in_order() {
        let inputs = vec![
            one_page_pdf("alpha"),
            one_page_pdf("beta"),
            one_page_pdf("gamma"),
        ];

        let output = merge_documents(&inputs).unwrap();
        let merged = Document::load_mem(&output).unwrap();

        assert_eq!(merged.get_pages().len(), 3);
        assert!(page_text(&merged, 1).contains("alpha"));
        assert!(page_text(&merged, 2).contains("beta"));
        assert!(page_text(&merged, 3).contains("gamma"));
    }

    #[test]
    fn test_single_document_round_trips() {
        let output = merge_documents(&[one_page_pdf("solo")]).unwrap();
        let merged = Document::load_mem(&output).unwrap();
        assert_eq!(merged.get_pages().len(), 1);
    }

    #[test]
    fn test_one_corrupt_input_fails_the_whole_batch() {
        let inputs = vec![
            one_page_pdf("good"),
            b"definitely not a pdf".to_vec(),
            one_page_pdf("also good"),
        ];

        match merge_documents(&inputs) {
            Err(MergeError::UnreadableInput { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected UnreadableInput, got {other:?}"),
        }
    }
}
