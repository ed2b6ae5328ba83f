// 构建脚本: 启用 ffmpeg 特性时链接FFmpeg依赖库
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // 未启用 ffmpeg 特性时无需额外链接
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();

    // 仅在Windows MSVC环境下添加FFmpeg相关库
    if os == "windows" && env == "msvc" {
        // Intel QSV 硬件加速 / x264 编码器
        for lib in ["libmfx", "libx264"] {
            println!("cargo:rustc-link-lib=dylib={}", lib);
        }
        // OLE 自动化, VFW, Secure Channel (TLS)
        for lib in ["oleaut32", "vfw32", "secur32"] {
            println!("cargo:rustc-link-lib=dylib={}", lib);
        }
    }
}
