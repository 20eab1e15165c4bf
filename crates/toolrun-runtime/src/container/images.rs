//! Tool image selection over the engine's image list.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::models::{ImageListOptions, ImageSummary, VERSION_LABEL};

/// Apply the name filter and the selection mode of `options` to `images`.
///
/// Mode precedence: `only_latest`, then `latest_by_version`, then
/// `latest_by_created`. Images lacking what the chosen mode needs (the
/// `latest` tag, a `version` label, a resolvable name) are dropped.
/// Output order follows the input order.
pub fn select_images(images: Vec<ImageSummary>, options: &ImageListOptions) -> Vec<ImageSummary> {
    let images: Vec<ImageSummary> = match &options.name {
        Some(name) => images
            .into_iter()
            .filter(|image| image.tool_name().as_deref() == Some(name.as_str()))
            .collect(),
        None => images,
    };

    if options.only_latest {
        return images
            .into_iter()
            .filter(|image| image.has_tag("latest"))
            .collect();
    }
    if options.latest_by_version {
        return latest_by_version(images);
    }
    if options.latest_by_created {
        return latest_by_created(images);
    }
    images
}

fn latest_by_version(images: Vec<ImageSummary>) -> Vec<ImageSummary> {
    let mut best: BTreeMap<String, String> = BTreeMap::new();
    for image in &images {
        let (Some(name), Some(version)) = (image.tool_name(), image.label(VERSION_LABEL)) else {
            continue;
        };
        match best.get(&name) {
            Some(current) if compare_versions(version, current) != Ordering::Greater => {}
            _ => {
                best.insert(name, version.to_string());
            }
        }
    }

    images
        .into_iter()
        .filter(|image| {
            match (image.tool_name(), image.label(VERSION_LABEL)) {
                (Some(name), Some(version)) => best
                    .get(&name)
                    .map(|max| compare_versions(version, max) == Ordering::Equal)
                    .unwrap_or(false),
                _ => false,
            }
        })
        .collect()
}

fn latest_by_created(images: Vec<ImageSummary>) -> Vec<ImageSummary> {
    let mut best: BTreeMap<String, (i64, String)> = BTreeMap::new();
    for image in &images {
        let Some(name) = image.tool_name() else {
            continue;
        };
        match best.get(&name) {
            Some((created, _)) if image.created <= *created => {}
            _ => {
                best.insert(name, (image.created, image.id.clone()));
            }
        }
    }

    images
        .into_iter()
        .filter(|image| {
            image
                .tool_name()
                .and_then(|name| best.get(&name))
                .map(|(_, id)| *id == image.id)
                .unwrap_or(false)
        })
        .collect()
}

/// Compare dotted versions segment by segment: numerically when both segments
/// are numbers, lexicographically otherwise. Missing segments sort first.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.trim_start_matches('v').split(['.', '-']);
    let mut right = b.trim_start_matches('v').split(['.', '-']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
