//! Reading Pascal VOC detection datasets from the filesystem.
//!
//! Layout (relative to the VOC root):
//! - `ImageSets/Main/<image_set>.txt`: one sample id per line
//! - `Annotations/<id>.xml`: object names and pixel boxes
//! - `JPEGImages/<id>.jpg`: the image

use crate::types::{BoxLabel, DatasetResult, VocDatasetError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Standard VOC class names; a class id is the index into this list.
pub const VOC_CLASSES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

const DEVKIT_SUBDIR: &str = "VOCdevkit/VOC2012";

pub fn class_index(name: &str) -> Option<usize> {
    VOC_CLASSES.iter().position(|c| *c == name.trim())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: ImageSize,
    #[serde(rename = "object", default)]
    pub objects: Vec<VocObject>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VocObject {
    pub name: String,
    #[serde(default)]
    pub pose: Option<String>,
    #[serde(default)]
    pub truncated: Option<u8>,
    #[serde(default)]
    pub difficult: Option<u8>,
    pub bndbox: BndBox,
}

/// Pixel-space box as written in the annotation file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BndBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Annotation {
    pub fn from_xml(raw: &str, path: &Path) -> DatasetResult<Self> {
        quick_xml::de::from_str(raw).map_err(|source| VocDatasetError::Xml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Normalize every object box against the decoded image size.
    pub fn to_box_labels(&self, width: u32, height: u32, path: &Path) -> DatasetResult<Vec<BoxLabel>> {
        if width == 0 || height == 0 {
            return Err(VocDatasetError::Validation {
                path: path.to_path_buf(),
                msg: format!("image has degenerate size {width}x{height}"),
            });
        }
        let (w, h) = (width as f32, height as f32);
        let mut labels = Vec::with_capacity(self.objects.len());
        for (i, obj) in self.objects.iter().enumerate() {
            let class_id = class_index(&obj.name).ok_or_else(|| VocDatasetError::Validation {
                path: path.to_path_buf(),
                msg: format!("object[{i}] has unknown class `{}`", obj.name),
            })?;
            let b = obj.bndbox;
            if [b.xmin, b.ymin, b.xmax, b.ymax].iter().any(|v| !v.is_finite()) {
                return Err(VocDatasetError::Validation {
                    path: path.to_path_buf(),
                    msg: format!("object[{i}] bndbox contains non-finite values"),
                });
            }
            if b.xmin >= b.xmax || b.ymin >= b.ymax {
                return Err(VocDatasetError::Validation {
                    path: path.to_path_buf(),
                    msg: format!("object[{i}] bndbox min>=max ({b:?})"),
                });
            }
            let mut bbox = [b.xmin / w, b.ymin / h, b.xmax / w, b.ymax / h];
            for v in bbox.iter_mut() {
                *v = v.clamp(0.0, 1.0);
            }
            labels.push(BoxLabel { class_id, bbox });
        }
        Ok(labels)
    }
}

#[derive(Debug, Clone)]
pub struct RawSample {
    pub id: String,
    pub image: image::RgbImage,
    pub annotation: Annotation,
    pub annotation_path: PathBuf,
}

/// Source of undecorated (image, annotation) pairs.
pub trait RawDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails with [`VocDatasetError::IndexOutOfRange`] when `index >= len()`.
    fn get(&self, index: usize) -> DatasetResult<RawSample>;
}

#[derive(Debug, Clone)]
pub struct VocDetection {
    root: PathBuf,
    image_set: String,
    ids: Vec<String>,
}

impl VocDetection {
    /// Index the ids listed for `image_set` (e.g. `train`, `val`, `trainval`).
    ///
    /// `folder` may be the VOC root itself or a directory containing `VOCdevkit/VOC2012`.
    pub fn new(folder: impl AsRef<Path>, image_set: &str) -> DatasetResult<Self> {
        let root = resolve_root(folder.as_ref());
        let list_path = root
            .join("ImageSets")
            .join("Main")
            .join(format!("{image_set}.txt"));
        let raw = fs::read_to_string(&list_path).map_err(|source| VocDatasetError::Io {
            path: list_path.clone(),
            source,
        })?;
        let ids: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        log::debug!(
            "indexed {} ids for image set `{image_set}` under {}",
            ids.len(),
            root.display()
        );
        Ok(Self {
            root,
            image_set: image_set.to_string(),
            ids,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_set(&self) -> &str {
        &self.image_set
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn annotation_path(&self, id: &str) -> PathBuf {
        self.root.join("Annotations").join(format!("{id}.xml"))
    }

    pub fn image_path(&self, id: &str) -> PathBuf {
        self.root.join("JPEGImages").join(format!("{id}.jpg"))
    }
}

impl RawDataset for VocDetection {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, index: usize) -> DatasetResult<RawSample> {
        let id = self
            .ids
            .get(index)
            .ok_or(VocDatasetError::IndexOutOfRange {
                index,
                len: self.ids.len(),
            })?;
        let annotation_path = self.annotation_path(id);
        let raw = fs::read_to_string(&annotation_path).map_err(|source| VocDatasetError::Io {
            path: annotation_path.clone(),
            source,
        })?;
        let annotation = Annotation::from_xml(&raw, &annotation_path)?;
        let image_path = self.image_path(id);
        let image = image::open(&image_path)
            .map_err(|source| VocDatasetError::Image {
                path: image_path.clone(),
                source,
            })?
            .to_rgb8();
        Ok(RawSample {
            id: id.clone(),
            image,
            annotation,
            annotation_path,
        })
    }
}

fn resolve_root(folder: &Path) -> PathBuf {
    let devkit = folder.join(DEVKIT_SUBDIR);
    if devkit.is_dir() {
        devkit
    } else {
        folder.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<annotation>
        <folder>VOC2012</folder>
        <filename>2007_000027.jpg</filename>
        <source><database>The VOC2007 Database</database></source>
        <size><width>486</width><height>500</height><depth>3</depth></size>
        <segmented>0</segmented>
        <object>
            <name>person</name>
            <pose>Unspecified</pose>
            <truncated>0</truncated>
            <difficult>0</difficult>
            <bndbox><xmin>174</xmin><ymin>101</ymin><xmax>349</xmax><ymax>351</ymax></bndbox>
        </object>
        <object>
            <name>dog</name>
            <bndbox><xmin>10.5</xmin><ymin>20</ymin><xmax>40</xmax><ymax>60</ymax></bndbox>
        </object>
    </annotation>"#;

    #[test]
    fn parses_objects_and_size() {
        let ann = Annotation::from_xml(SAMPLE_XML, Path::new("a.xml")).unwrap();
        assert_eq!(ann.filename, "2007_000027.jpg");
        assert_eq!(ann.size.width, 486);
        assert_eq!(ann.objects.len(), 2);
        assert_eq!(ann.objects[0].name, "person");
        assert_eq!(ann.objects[0].difficult, Some(0));
        assert_eq!(ann.objects[1].pose, None);
        assert!((ann.objects[1].bndbox.xmin - 10.5).abs() < 1e-6);
    }

    #[test]
    fn normalizes_boxes_against_image_size() {
        let ann = Annotation::from_xml(SAMPLE_XML, Path::new("a.xml")).unwrap();
        let labels = ann.to_box_labels(486, 500, Path::new("a.xml")).unwrap();
        assert_eq!(labels[0].class_id, class_index("person").unwrap());
        assert!((labels[0].bbox[2] - 349.0 / 486.0).abs() < 1e-6);
        assert!((labels[0].bbox[3] - 351.0 / 500.0).abs() < 1e-6);
        assert_eq!(labels[1].class_id, 11);
    }

    #[test]
    fn unknown_class_is_a_validation_error() {
        let xml = SAMPLE_XML.replace("<name>dog</name>", "<name>dragon</name>");
        let ann = Annotation::from_xml(&xml, Path::new("a.xml")).unwrap();
        let err = ann.to_box_labels(486, 500, Path::new("a.xml")).unwrap_err();
        assert!(matches!(err, VocDatasetError::Validation { .. }));
        assert!(err.to_string().contains("dragon"));
    }

    #[test]
    fn annotation_without_objects_is_empty() {
        let xml = "<annotation><filename>x.jpg</filename></annotation>";
        let ann = Annotation::from_xml(xml, Path::new("x.xml")).unwrap();
        assert!(ann.objects.is_empty());
    }

    #[test]
    fn missing_image_set_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = VocDetection::new(tmp.path(), "trainval").unwrap_err();
        assert!(matches!(err, VocDatasetError::Io { .. }));
    }
}
