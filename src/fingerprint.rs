use image::DynamicImage;
use img_hash::{HashAlg, HasherConfig}; // pHash 配置器和算法枚举
use sha2::{Digest, Sha256};

/// 内容指纹 (SHA256, 小写十六进制)
///
/// 解决“原始完整性”：文件哪怕改了一个字节，这个值都会雪崩式变化。
/// 素材身份和历史记录里的溯源都靠它。
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 视觉感知哈希 (pHash)，Base64 编码
///
/// 解决“内容同一性”：图片经过压缩、缩放，SHA256 会全变，但 pHash 依然相似。
/// 只对已经解码成功的图片有意义，视频没有这一项。
pub fn perceptual_hash(img: &DynamicImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient) // 梯度算法，比均值算法对明暗变化更鲁棒
        .hash_size(8, 8) // 8x8 = 64 位指纹
        .to_hasher();

    hasher.hash_image(img).to_base64()
}
