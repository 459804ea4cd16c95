//! Builds a [`DocumentTree`] from extractor output: ordered blocks plus
//! image regions interleaved by reading-order position.

use std::collections::HashMap;

use crate::model::{DocumentTree, NodeKind};
use crate::ports::{BlockRole, ExtractedDocument, ImageRegion};

/// Merges extracted blocks and image captions into a single ordered tree,
/// maintaining a stack of open sections keyed by heading depth: a heading of
/// depth `d` pops every open section of depth `>= d` before opening its own.
pub struct TreeBuilder;

impl TreeBuilder {
    pub fn new() -> Self {
        Self
    }

    /// `image_captions` maps an image region's `order` to its
    /// VisionDescriber-produced caption; regions without a caption are
    /// skipped (the describe-images stage may be disabled).
    pub fn build(&self, extracted: &ExtractedDocument, image_captions: &HashMap<usize, String>) -> DocumentTree {
        let mut tree = DocumentTree::with_root();
        // (depth, node_index) stack of open sections, root implicitly at depth 0.
        let mut section_stack: Vec<(u32, usize)> = Vec::new();

        let mut images: Vec<&ImageRegion> = image_captions
            .keys()
            .filter_map(|order| extracted.image_regions.iter().find(|r| r.order == *order))
            .collect();
        images.sort_by_key(|r| r.order);
        let mut image_iter = images.into_iter().peekable();

        for block in &extracted.blocks {
            while image_iter.peek().is_some_and(|img| img.order < block.order) {
                let img = image_iter.next().unwrap();
                self.push_image(&mut tree, &mut section_stack, img, image_captions);
            }

            let parent = section_stack.last().map(|(_, idx)| *idx).unwrap_or(DocumentTree::ROOT);
            match block.role {
                BlockRole::Heading => {
                    while section_stack.last().is_some_and(|(depth, _)| *depth >= block.depth) {
                        section_stack.pop();
                    }
                    let parent = section_stack.last().map(|(_, idx)| *idx).unwrap_or(DocumentTree::ROOT);
                    let idx = tree.push_child(
                        parent,
                        NodeKind::Section { title: block.text.clone(), depth: block.depth, role: None },
                        String::new(),
                        block.page_number,
                    );
                    section_stack.push((block.depth, idx));
                }
                BlockRole::Paragraph => {
                    tree.push_child(parent, NodeKind::Paragraph, block.text.clone(), block.page_number);
                }
                BlockRole::Table => {
                    tree.push_child(parent, NodeKind::Table, block.text.clone(), block.page_number);
                }
            }
        }

        for img in image_iter {
            self.push_image(&mut tree, &mut section_stack, img, image_captions);
        }

        tree
    }

    fn push_image(&self, tree: &mut DocumentTree, section_stack: &mut [(u32, usize)], img: &ImageRegion, captions: &HashMap<usize, String>) {
        let caption = captions.get(&img.order).cloned().unwrap_or_default();
        let parent = section_stack.last().map(|(_, idx)| *idx).unwrap_or(DocumentTree::ROOT);
        tree.push_child(parent, NodeKind::ImageDescription, caption, img.page_number);
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
