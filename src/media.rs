use crate::error::{WorkflowError, WorkflowResult};
use crate::fingerprint;
use image::{GenericImageView, ImageOutputFormat};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 媒体类别
///
/// 只按声明的 content-type 推断：包含 `video` 的就是视频，其余一律按图片处理。
/// 不做白名单，未知类型也接受，content-type 原文会随素材一起保留。
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum MimeCategory {
    Image,
    Video,
}

impl MimeCategory {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("video") {
            MimeCategory::Video
        } else {
            MimeCategory::Image
        }
    }

    /// 结果页展示的文件类型
    pub fn label(&self) -> &'static str {
        match self {
            MimeCategory::Image => "Image",
            MimeCategory::Video => "Video",
        }
    }
}

/// 素材身份，每次选择文件递增，不复用
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId(pub u64);

/// 用户提交的一个文件 (相当于浏览器里的 File 对象)
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// 一次选择/拖放的输入，只取第一个文件
#[derive(Debug, Clone, Default)]
pub struct FileSelection {
    pub files: Vec<FileUpload>,
}

impl FileSelection {
    pub fn single(file: FileUpload) -> Self {
        Self { files: vec![file] }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<FileUpload> for FileSelection {
    fn from(file: FileUpload) -> Self {
        Self::single(file)
    }
}

/// 已暂存的待检素材
///
/// 创建后不可变；新的选择会整体替换它。原始字节用 `Arc` 共享，
/// 交给后端分析时不发生拷贝。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub id: AssetId,
    pub name: String,
    pub byte_size: u64,
    pub mime_category: MimeCategory,
    pub content_type: String,
    pub sha256: String,
    #[serde(skip)]
    content: Arc<[u8]>,
}

impl MediaAsset {
    pub fn bytes(&self) -> &[u8] {
        &self.content
    }
}

/// 可渲染的预览句柄
///
/// - `Image`: 解码成功的图片，缩略图重新编码为 PNG，附带感知哈希。
/// - `Raw`: 视频或无法解码的内容，原样透传给视图层。
#[derive(Debug, Clone)]
pub enum PreviewHandle {
    Image {
        width: u32,
        height: u32,
        thumbnail_png: Arc<[u8]>,
        perceptual_hash: String,
    },
    Raw {
        content_type: String,
        bytes: Arc<[u8]>,
    },
}

impl PreviewHandle {
    pub fn content_type(&self) -> &str {
        match self {
            PreviewHandle::Image { .. } => "image/png",
            PreviewHandle::Raw { content_type, .. } => content_type,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            PreviewHandle::Image { thumbnail_png, .. } => thumbnail_png,
            PreviewHandle::Raw { bytes, .. } => bytes,
        }
    }

    /// 给视图层的摘要，不含字节
    pub fn info(&self) -> PreviewInfo {
        match self {
            PreviewHandle::Image {
                width,
                height,
                perceptual_hash,
                ..
            } => PreviewInfo {
                kind: "image",
                content_type: self.content_type().to_string(),
                width: Some(*width),
                height: Some(*height),
                perceptual_hash: Some(perceptual_hash.clone()),
                byte_len: self.bytes().len(),
            },
            PreviewHandle::Raw { content_type, bytes } => PreviewInfo {
                kind: "raw",
                content_type: content_type.clone(),
                width: None,
                height: None,
                perceptual_hash: None,
                byte_len: bytes.len(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    pub kind: &'static str,
    pub content_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub perceptual_hash: Option<String>,
    pub byte_len: usize,
}

/// 预览槽位：记录它属于哪个素材，解码完成前 `handle` 为空
#[derive(Debug, Clone, Default)]
pub struct PreviewState {
    pub asset: Option<AssetId>,
    pub handle: Option<PreviewHandle>,
}

/// 模块：素材接收 (Media Intake)
///
/// **职责**: 校验并暂存用户选择的文件，同一时刻最多只有一个活跃素材。
/// 预览解码放到阻塞线程池里异步进行，解码结果通过 watch 通道发布；
/// 如果解码完成时素材已经被替换或清除，结果直接丢弃。
pub struct MediaIntake {
    next_id: u64,
    current: Option<MediaAsset>,
    preview_tx: Arc<watch::Sender<PreviewState>>,
    preview_max_dim: u32,
}

impl MediaIntake {
    pub fn new(preview_max_dim: u32) -> Self {
        let (tx, _rx) = watch::channel(PreviewState::default());
        Self {
            next_id: 1,
            current: None,
            preview_tx: Arc::new(tx),
            preview_max_dim: preview_max_dim.max(1),
        }
    }

    /// 暂存新文件，整体替换旧素材
    pub fn select_file(&mut self, selection: FileSelection) -> WorkflowResult<MediaAsset> {
        let file = selection
            .files
            .into_iter()
            .next()
            .ok_or_else(|| WorkflowError::InvalidInput("no file provided".to_string()))?;

        if file.name.trim().is_empty() {
            return Err(WorkflowError::InvalidInput("file name is empty".to_string()));
        }

        let id = AssetId(self.next_id);
        self.next_id += 1;

        let asset = MediaAsset {
            id,
            name: file.name,
            byte_size: file.bytes.len() as u64,
            mime_category: MimeCategory::from_content_type(&file.content_type),
            sha256: fingerprint::content_digest(&file.bytes),
            content_type: file.content_type,
            content: Arc::from(file.bytes),
        };

        info!(
            asset = id.0,
            name = %asset.name,
            bytes = asset.byte_size,
            category = asset.mime_category.label(),
            "asset staged"
        );

        self.preview_tx.send_modify(|slot| {
            slot.asset = Some(id);
            slot.handle = None;
        });
        self.spawn_preview_decode(&asset);
        self.current = Some(asset.clone());

        Ok(asset)
    }

    /// 释放当前素材和预览，重复调用无副作用
    pub fn clear(&mut self) {
        if let Some(asset) = self.current.take() {
            debug!(asset = asset.id.0, "asset cleared");
        }
        self.preview_tx.send_if_modified(|slot| {
            let changed = slot.asset.is_some() || slot.handle.is_some();
            slot.asset = None;
            slot.handle = None;
            changed
        });
    }

    pub fn current(&self) -> Option<&MediaAsset> {
        self.current.as_ref()
    }

    /// 当前预览；解码尚未完成时为 `None`
    pub fn preview(&self) -> Option<PreviewHandle> {
        let slot = self.preview_tx.borrow();
        match (&self.current, slot.asset) {
            (Some(asset), Some(owner)) if asset.id == owner => slot.handle.clone(),
            _ => None,
        }
    }

    pub fn subscribe_preview(&self) -> watch::Receiver<PreviewState> {
        self.preview_tx.subscribe()
    }

    fn spawn_preview_decode(&self, asset: &MediaAsset) {
        let tx = Arc::clone(&self.preview_tx);
        let asset = asset.clone();
        let max_dim = self.preview_max_dim;

        // 有运行时就丢进阻塞线程池；同步上下文里 (例如基准测试) 直接就地解码
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let preview = decode_preview(&asset, max_dim);
                    install_preview(&tx, asset.id, preview);
                });
            }
            Err(_) => {
                let preview = decode_preview(&asset, max_dim);
                install_preview(&tx, asset.id, preview);
            }
        }
    }
}

fn install_preview(tx: &watch::Sender<PreviewState>, id: AssetId, preview: PreviewHandle) {
    let installed = tx.send_if_modified(|slot| {
        if slot.asset == Some(id) {
            slot.handle = Some(preview);
            true
        } else {
            false
        }
    });
    if installed {
        debug!(asset = id.0, "preview ready");
    } else {
        debug!(asset = id.0, "stale preview discarded");
    }
}

/// 解码预览：图片 -> 缩略图 PNG + pHash；其余原样透传
pub fn decode_preview(asset: &MediaAsset, max_dim: u32) -> PreviewHandle {
    let raw = || PreviewHandle::Raw {
        content_type: asset.content_type.clone(),
        bytes: Arc::clone(&asset.content),
    };

    if asset.mime_category != MimeCategory::Image {
        return raw();
    }

    let img = match image::load_from_memory(asset.bytes()) {
        Ok(img) => img,
        Err(e) => {
            warn!(asset = asset.id.0, error = %e, "image decode failed, using raw preview");
            return raw();
        }
    };

    let (width, height) = img.dimensions();
    let thumbnail = img.thumbnail(max_dim, max_dim);
    let mut png = Vec::new();
    if let Err(e) = thumbnail.write_to(&mut png, ImageOutputFormat::Png) {
        warn!(asset = asset.id.0, error = %e, "thumbnail encode failed, using raw preview");
        return raw();
    }

    PreviewHandle::Image {
        width,
        height,
        thumbnail_png: Arc::from(png),
        perceptual_hash: fingerprint::perceptual_hash(&img),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn category_follows_declared_content_type() {
        assert_eq!(MimeCategory::from_content_type("video/mp4"), MimeCategory::Video);
        assert_eq!(MimeCategory::from_content_type("VIDEO/webm"), MimeCategory::Video);
        assert_eq!(MimeCategory::from_content_type("image/jpeg"), MimeCategory::Image);
        // 未知类型降级为图片
        assert_eq!(
            MimeCategory::from_content_type("application/octet-stream"),
            MimeCategory::Image
        );
    }

    #[test]
    fn empty_selection_is_rejected() {
        let mut intake = MediaIntake::new(64);
        let err = intake.select_file(FileSelection::empty()).unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
        assert!(intake.current().is_none());
    }

    #[test]
    fn blank_name_is_rejected() {
        let mut intake = MediaIntake::new(64);
        let err = intake
            .select_file(FileUpload::new("  ", "image/png", vec![1, 2, 3]).into())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }

    #[test]
    fn file_name_is_kept_verbatim() {
        let mut intake = MediaIntake::new(64);
        let asset = intake
            .select_file(FileUpload::new(" face.jpg ", "image/jpeg", vec![1, 2, 3]).into())
            .unwrap();
        assert_eq!(asset.name, " face.jpg ");
    }

    #[test]
    fn only_first_file_of_selection_is_staged() {
        let mut intake = MediaIntake::new(64);
        let selection = FileSelection {
            files: vec![
                FileUpload::new("a.mp4", "video/mp4", vec![0; 10]),
                FileUpload::new("b.jpg", "image/jpeg", vec![0; 20]),
            ],
        };
        let asset = intake.select_file(selection).unwrap();
        assert_eq!(asset.name, "a.mp4");
        assert_eq!(asset.byte_size, 10);
        assert_eq!(asset.mime_category, MimeCategory::Video);
    }

    #[test]
    fn new_selection_replaces_asset_and_ids_increase() {
        let mut intake = MediaIntake::new(64);
        let first = intake
            .select_file(FileUpload::new("a.jpg", "image/jpeg", vec![1]).into())
            .unwrap();
        let second = intake
            .select_file(FileUpload::new("b.jpg", "image/jpeg", vec![2]).into())
            .unwrap();
        assert!(second.id > first.id);
        assert_eq!(intake.current().map(|a| a.id), Some(second.id));
    }

    #[test]
    fn decoding_outside_runtime_installs_preview_inline() {
        let mut intake = MediaIntake::new(16);
        intake
            .select_file(FileUpload::new("face.png", "image/png", png_bytes(40, 20)).into())
            .unwrap();

        match intake.preview() {
            Some(PreviewHandle::Image { width, height, thumbnail_png, .. }) => {
                assert_eq!((width, height), (40, 20));
                let thumb = image::load_from_memory(&thumbnail_png).unwrap();
                assert!(thumb.width() <= 16 && thumb.height() <= 16);
            }
            other => panic!("expected image preview, got {:?}", other),
        }
    }

    #[test]
    fn undecodable_image_falls_back_to_raw_preview() {
        let mut intake = MediaIntake::new(16);
        intake
            .select_file(FileUpload::new("broken.jpg", "image/jpeg", vec![0xde, 0xad]).into())
            .unwrap();
        let preview = intake.preview().unwrap();
        assert_eq!(preview.content_type(), "image/jpeg");
        assert_eq!(preview.bytes(), &[0xde, 0xad]);
        assert_eq!(preview.info().kind, "raw");
    }

    #[test]
    fn clear_is_idempotent_and_drops_preview() {
        let mut intake = MediaIntake::new(16);
        intake
            .select_file(FileUpload::new("clip.mp4", "video/mp4", vec![9; 8]).into())
            .unwrap();
        assert!(intake.preview().is_some());

        intake.clear();
        intake.clear();
        assert!(intake.current().is_none());
        assert!(intake.preview().is_none());
        assert!(intake.subscribe_preview().borrow().asset.is_none());
    }

    #[tokio::test]
    async fn preview_is_published_asynchronously_inside_runtime() {
        let mut intake = MediaIntake::new(32);
        let asset = intake
            .select_file(FileUpload::new("face.png", "image/png", png_bytes(8, 8)).into())
            .unwrap();

        let mut rx = intake.subscribe_preview();
        let slot = rx
            .wait_for(|s| s.asset == Some(asset.id) && s.handle.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(slot.handle.unwrap().info().width, Some(8));
        assert!(intake.preview().is_some());
    }
}
