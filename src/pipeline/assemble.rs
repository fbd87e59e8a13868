//! EPUB3 assembly: page texts → chaptered e-book with RTL/LTR styling.
//!
//! The assembler owns the whole container: `mimetype` (stored, first entry,
//! as the EPUB OCF spec requires), `META-INF/container.xml`, the package
//! document, the navigation document, one stylesheet, and one XHTML file
//! per chapter. Every zip entry carries the same fixed 1980 DOS-epoch
//! timestamp, so assembling the same inputs twice yields byte-identical
//! files. Re-running a retry with no new successes rewrites the EPUB
//! without spuriously changing it.
//!
//! Failed pages are kept in place as a short placeholder so pagination
//! stays aligned with the source book; a reader can tell exactly which
//! scanned page is missing.

use crate::error::AssembleError;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Book-level metadata for the package document.
#[derive(Debug, Clone)]
pub struct BookMeta {
    /// Title, typically the upload filename minus its extension.
    pub title: String,
    /// Language code: `fa`, `ar`, or `en`.
    pub language: String,
    /// Unique identifier; the job id.
    pub identifier: String,
}

/// Build an EPUB3 file from ordered page texts.
///
/// `page_texts` holds one entry per source page, in page order; an empty
/// string marks a page whose OCR failed (rendered as a placeholder).
/// The file is written atomically (temp + rename). Blocking; run it on a
/// worker thread.
pub fn assemble_epub(
    page_texts: &[String],
    meta: &BookMeta,
    pages_per_chapter: usize,
    output_path: &Path,
) -> Result<(), AssembleError> {
    let pages_per_chapter = pages_per_chapter.max(1);
    let total = page_texts.len();
    let chapter_count = total.div_ceil(pages_per_chapter).max(1);
    let rtl = is_rtl(&meta.language);
    let dir = if rtl { "rtl" } else { "ltr" };

    let tmp_path = output_path.with_extension("epub.tmp");
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| AssembleError::OutputWrite {
            path: output_path.to_path_buf(),
            source,
        })?;
    }
    let file = std::fs::File::create(&tmp_path).map_err(|source| AssembleError::OutputWrite {
        path: tmp_path.clone(),
        source,
    })?;

    let mut zip = ZipWriter::new(file);
    // Fixed timestamp (1980-01-01, the DOS epoch) keeps output reproducible.
    let stored: FileOptions = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default());
    let deflated: FileOptions = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    // The OCF spec requires `mimetype` first and uncompressed.
    zip.start_file("mimetype", stored)?;
    zip.write_all(b"application/epub+zip")
        .map_err(container_io)?;

    zip.start_file("META-INF/container.xml", deflated)?;
    zip.write_all(CONTAINER_XML.as_bytes()).map_err(container_io)?;

    zip.start_file("OEBPS/package.opf", deflated)?;
    zip.write_all(package_opf(meta, dir, chapter_count).as_bytes())
        .map_err(container_io)?;

    zip.start_file("OEBPS/nav.xhtml", deflated)?;
    zip.write_all(nav_xhtml(meta, dir, chapter_count).as_bytes())
        .map_err(container_io)?;

    zip.start_file("OEBPS/style.css", deflated)?;
    zip.write_all(stylesheet(rtl).as_bytes()).map_err(container_io)?;

    for chapter in 1..=chapter_count {
        let start = (chapter - 1) * pages_per_chapter;
        let end = (start + pages_per_chapter).min(total);
        zip.start_file(format!("OEBPS/{}", chapter_file(chapter)), deflated)?;
        zip.write_all(chapter_xhtml(meta, dir, chapter, &page_texts[start.min(total)..end], start).as_bytes())
            .map_err(container_io)?;
    }

    zip.finish()?;

    std::fs::rename(&tmp_path, output_path).map_err(|source| AssembleError::OutputWrite {
        path: output_path.to_path_buf(),
        source,
    })
}

fn container_io(e: std::io::Error) -> AssembleError {
    AssembleError::Container(e.to_string())
}

fn is_rtl(language: &str) -> bool {
    matches!(language, "fa" | "ar")
}

fn chapter_file(chapter: usize) -> String {
    format!("chapter_{chapter:03}.xhtml")
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/package.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

fn package_opf(meta: &BookMeta, dir: &str, chapter_count: usize) -> String {
    let mut manifest = String::new();
    let mut spine = String::new();
    for chapter in 1..=chapter_count {
        manifest.push_str(&format!(
            "    <item id=\"chapter_{chapter:03}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            chapter_file(chapter)
        ));
        spine.push_str(&format!("    <itemref idref=\"chapter_{chapter:03}\"/>\n"));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="bookid" xml:lang="{lang}" dir="{dir}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="bookid">urn:vision-epub:{id}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>{lang}</dc:language>
    <dc:creator>Vision OCR</dc:creator>
    <meta property="dcterms:modified">1970-01-01T00:00:00Z</meta>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="style" href="style.css" media-type="text/css"/>
{manifest}  </manifest>
  <spine>
{spine}  </spine>
</package>
"#,
        lang = escape_xml(&meta.language),
        dir = dir,
        id = escape_xml(&meta.identifier),
        title = escape_xml(&meta.title),
        manifest = manifest,
        spine = spine,
    )
}

fn nav_xhtml(meta: &BookMeta, dir: &str, chapter_count: usize) -> String {
    let mut items = String::new();
    for chapter in 1..=chapter_count {
        items.push_str(&format!(
            "      <li><a href=\"{}\">Chapter {chapter}</a></li>\n",
            chapter_file(chapter)
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}" dir="{dir}">
<head>
  <title>{title}</title>
  <link rel="stylesheet" type="text/css" href="style.css"/>
</head>
<body>
  <nav epub:type="toc" id="toc">
    <h1>Contents</h1>
    <ol>
{items}    </ol>
  </nav>
</body>
</html>
"#,
        lang = escape_xml(&meta.language),
        dir = dir,
        title = escape_xml(&meta.title),
        items = items,
    )
}

fn stylesheet(rtl: bool) -> String {
    let (dir, font_family) = if rtl {
        ("rtl", "Tahoma, 'Noto Naskh Arabic', serif")
    } else {
        ("ltr", "Georgia, serif")
    };
    format!(
        r#"html, body {{
    direction: {dir};
}}
body {{
    unicode-bidi: embed;
    font-family: {font_family};
    font-size: 1.1em;
    line-height: 1.8;
    margin: 1em;
    text-align: justify;
}}
p {{
    margin: 0.5em 0;
    text-indent: 1em;
}}
.failed-page {{
    color: #999;
    font-style: italic;
    text-align: center;
    padding: 2em 0;
}}
hr.page-break {{
    border: none;
    margin: 1.5em 0;
}}
"#
    )
}

fn chapter_xhtml(
    meta: &BookMeta,
    dir: &str,
    chapter: usize,
    texts: &[String],
    first_page: usize,
) -> String {
    let mut body = String::new();
    for (offset, text) in texts.iter().enumerate() {
        if offset > 0 {
            body.push_str("    <hr class=\"page-break\"/>\n");
        }
        let page = first_page + offset;
        if text.trim().is_empty() {
            body.push_str(&format!(
                "    <p class=\"failed-page\">[Page {}: OCR failed]</p>\n",
                page + 1
            ));
            continue;
        }
        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            let escaped = escape_xml(paragraph).replace('\n', "<br/>");
            body.push_str(&format!("    <p dir=\"auto\">{escaped}</p>\n"));
        }
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="{lang}" dir="{dir}">
<head>
  <title>Chapter {chapter}</title>
  <link rel="stylesheet" type="text/css" href="style.css"/>
</head>
<body dir="{dir}">
{body}</body>
</html>
"#,
        lang = escape_xml(&meta.language),
        dir = dir,
        chapter = chapter,
        body = body,
    )
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    fn meta(language: &str) -> BookMeta {
        BookMeta {
            title: "My Book".into(),
            language: language.into(),
            identifier: "abc123def456".into(),
        }
    }

    fn read_entry(path: &Path, name: &str) -> String {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut out = String::new();
        entry.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn three_pages_make_one_chapter() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        let pages = vec![
            "صفحه اول".to_string(),
            "صفحه دوم".to_string(),
            "صفحه سوم".to_string(),
        ];
        assemble_epub(&pages, &meta("fa"), 20, &out).unwrap();

        let file = std::fs::File::open(&out).unwrap();
        let archive = ZipArchive::new(file).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"OEBPS/chapter_001.xhtml"));
        assert!(!names.iter().any(|n| n.contains("chapter_002")));

        let chapter = read_entry(&out, "OEBPS/chapter_001.xhtml");
        assert!(chapter.contains("صفحه اول"));
        assert!(chapter.contains("صفحه سوم"));
        assert!(chapter.contains("<title>Chapter 1</title>"));
        // Two separators between three pages.
        assert_eq!(chapter.matches("page-break").count(), 2);
    }

    #[test]
    fn chapter_grouping_splits_every_n_pages() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        let pages: Vec<String> = (0..45).map(|i| format!("page {i}")).collect();
        assemble_epub(&pages, &meta("en"), 20, &out).unwrap();

        let ch1 = read_entry(&out, "OEBPS/chapter_001.xhtml");
        let ch3 = read_entry(&out, "OEBPS/chapter_003.xhtml");
        assert!(ch1.contains("page 0") && ch1.contains("page 19"));
        assert!(ch3.contains("page 40") && ch3.contains("page 44"));

        let nav = read_entry(&out, "OEBPS/nav.xhtml");
        assert!(nav.contains(">Chapter 3<"));
        assert!(!nav.contains(">Chapter 4<"));
    }

    #[test]
    fn rtl_languages_get_rtl_stylesheet_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        assemble_epub(&["متن".to_string()], &meta("fa"), 20, &out).unwrap();

        let css = read_entry(&out, "OEBPS/style.css");
        assert!(css.contains("direction: rtl"));
        assert!(css.contains("Noto Naskh Arabic"));

        let opf = read_entry(&out, "OEBPS/package.opf");
        assert!(opf.contains("<dc:language>fa</dc:language>"));
        assert!(opf.contains("dir=\"rtl\""));
        assert!(opf.contains("urn:vision-epub:abc123def456"));
        assert!(opf.contains("<dc:creator>Vision OCR</dc:creator>"));
    }

    #[test]
    fn ltr_language_gets_ltr_stylesheet() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        assemble_epub(&["text".to_string()], &meta("en"), 20, &out).unwrap();
        let css = read_entry(&out, "OEBPS/style.css");
        assert!(css.contains("direction: ltr"));
        assert!(!css.contains("direction: rtl"));
    }

    #[test]
    fn failed_page_becomes_placeholder_in_position() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        let pages = vec!["first".to_string(), String::new(), "third".to_string()];
        assemble_epub(&pages, &meta("en"), 20, &out).unwrap();

        let chapter = read_entry(&out, "OEBPS/chapter_001.xhtml");
        let first = chapter.find("first").unwrap();
        let failed = chapter.find("[Page 2: OCR failed]").unwrap();
        let third = chapter.find("third").unwrap();
        assert!(first < failed && failed < third, "placeholder keeps position");
    }

    #[test]
    fn paragraphs_split_on_blank_lines_with_dir_auto() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        let pages = vec!["para one\nstill one\n\npara <two> & more".to_string()];
        assemble_epub(&pages, &meta("en"), 20, &out).unwrap();

        let chapter = read_entry(&out, "OEBPS/chapter_001.xhtml");
        assert_eq!(chapter.matches("<p dir=\"auto\">").count(), 2);
        assert!(chapter.contains("para one<br/>still one"));
        assert!(chapter.contains("para &lt;two&gt; &amp; more"));
    }

    #[test]
    fn mimetype_is_first_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        assemble_epub(&["x".to_string()], &meta("en"), 20, &out).unwrap();

        let file = std::fs::File::open(&out).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "mimetype");
        assert_eq!(entry.compression(), CompressionMethod::Stored);
    }

    #[test]
    fn output_is_byte_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        let b = dir.path().join("b.epub");
        let pages = vec!["same text".to_string(), String::new()];
        assemble_epub(&pages, &meta("fa"), 20, &a).unwrap();
        assemble_epub(&pages, &meta("fa"), 20, &b).unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    }

    #[test]
    fn escape_xml_covers_the_five() {
        assert_eq!(escape_xml(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&apos;&amp;&apos;&lt;/a&gt;");
    }
}
