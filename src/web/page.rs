//! HTML page rendering
//!
//! One page: a sidebar mode selector, the upload form and whatever the
//! dispatcher produced. Images are embedded as PNG data URIs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use super::error::WebError;
use super::upload::ALLOWED_EXTENSIONS;
use crate::app::{Mode, PageView};

/// An image ready to embed
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub caption: String,
    pub data_uri: String,
}

/// Escape text for use in HTML content and attribute values
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Encode an image as a `data:image/png;base64,...` URI
pub fn png_data_uri(image: &DynamicImage) -> Result<String, WebError> {
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png).map_err(WebError::Encode)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png.into_inner())))
}

/// Encode every image of a view
pub fn encode_images(view: &PageView) -> Result<Vec<EncodedImage>, WebError> {
    view.images
        .iter()
        .map(|img| {
            Ok(EncodedImage {
                caption: img.caption.clone(),
                data_uri: png_data_uri(&img.image)?,
            })
        })
        .collect()
}

/// Render the full page
pub fn render_page(view: &PageView, images: &[EncodedImage], error: Option<&str>) -> String {
    let accept = ALLOWED_EXTENSIONS
        .iter()
        .map(|ext| format!(".{ext}"))
        .collect::<Vec<_>>()
        .join(",");

    let options: String = Mode::ALL
        .iter()
        .map(|mode| {
            let selected = if *mode == view.mode { " selected" } else { "" };
            format!(
                r#"<option value="{}"{}>{}</option>"#,
                mode.slug(),
                selected,
                mode.label()
            )
        })
        .collect();

    let mut sections = Vec::new();
    if let Some(error) = error {
        sections.push(format!(r#"<div class="error">{}</div>"#, escape_html(error)));
    }
    if let Some(notice) = &view.notice {
        sections.push(format!(r#"<div class="notice">{}</div>"#, escape_html(notice)));
    }
    sections.extend(images.iter().map(|image| {
        let caption = escape_html(&image.caption);
        format!(
            r#"<figure><img src="{}" alt="{caption}"><figcaption>{caption}</figcaption></figure>"#,
            image.data_uri
        )
    }));
    if let Some(text) = &view.text {
        sections.push(format!("<h3>Extracted Text:</h3><pre>{}</pre>", escape_html(text)));
    }
    let body = sections.concat();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Combined App</title>
<style>
body {{ margin: 0; display: flex; font-family: sans-serif; }}
aside {{ width: 16rem; min-height: 100vh; padding: 1rem; background: #f0f2f6; }}
main {{ flex: 1; max-width: 46rem; padding: 1rem 2rem; }}
figure {{ margin: 1rem 0; }}
img {{ max-width: 100%; }}
figcaption {{ color: #666; text-align: center; }}
pre {{ white-space: pre-wrap; }}
.error {{ padding: .75rem; background: #ffe4e4; color: #7d1a1a; }}
.notice {{ padding: .75rem; background: #fff6d6; }}
</style>
</head>
<body>
<aside>
<label for="mode">Select App Mode</label>
<select id="mode" name="mode" form="upload" onchange="window.location.search = '?mode=' + this.value">{options}</select>
</aside>
<main>
<h1>{title}</h1>
<form id="upload" method="post" action="/" enctype="multipart/form-data">
<label for="file">Choose an image...</label>
<input id="file" type="file" name="file" accept="{accept}">
<button type="submit">Upload</button>
</form>
{body}
</main>
</body>
</html>
"#,
        title = escape_html(view.title),
    )
}
