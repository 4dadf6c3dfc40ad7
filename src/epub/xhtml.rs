//! EPUB 内部 XML/XHTML 文档构建。
//!
//! 所有 XML 都经由 quick-xml 的事件写入器生成，文本内容自动转义；
//! 不做字符串拼接。

use std::io::Cursor;
use std::sync::OnceLock;

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use regex::Regex;

pub const MIMETYPE: &str = "application/epub+zip";

pub const DEFAULT_CSS: &str = "body{font-family:serif;line-height:1.4;margin:5%}\
h1{text-align:center;margin:2em 0 1em}\
p{text-indent:1.5em;margin:0 0 1em}\
img{max-width:100%;height:auto}";

const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

#[derive(Debug, Clone)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
}

#[derive(Debug, Clone)]
pub struct NavPoint {
    pub id: String,
    pub play_order: usize,
    pub label: String,
    pub src: String,
}

/// OPF 可选元数据。
#[derive(Debug, Clone, Default)]
pub struct OpfExtras {
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<u32>,
}

/// 把正文按空行分组：每组是一个 `<p>`，组内行用 `<br/>` 连接。
pub fn paragraph_lines(text: &str) -> Vec<Vec<String>> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            current.push(trimmed.to_string());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

/// 去掉残留 HTML 标签并反转义实体（用于来源文本本身带标记的场合）。
pub fn strip_html_unescape(text: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());
    let stripped = re.replace_all(text, "");
    html_escape::decode_html_entities(&stripped).into_owned()
}

fn new_writer() -> Writer<Cursor<Vec<u8>>> {
    Writer::new(Cursor::new(Vec::new()))
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> Result<String> {
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

/// 章节 XHTML：`<html><head><title/><link css/></head><body><h1/><p>…</p></body></html>`。
pub fn build_chap_xhtml(title: &str, paragraphs: &[Vec<String>]) -> Result<String> {
    let mut w = new_writer();
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    w.write_event(Event::DocType(BytesText::from_escaped("html")))?;

    let mut html = BytesStart::new("html");
    html.push_attribute(("xmlns", XHTML_NS));
    w.write_event(Event::Start(html))?;

    w.write_event(Event::Start(BytesStart::new("head")))?;
    w.write_event(Event::Start(BytesStart::new("title")))?;
    w.write_event(Event::Text(BytesText::new(title)))?;
    w.write_event(Event::End(BytesEnd::new("title")))?;
    let mut link = BytesStart::new("link");
    link.push_attribute(("href", "../Styles/style.css"));
    link.push_attribute(("rel", "stylesheet"));
    link.push_attribute(("type", "text/css"));
    w.write_event(Event::Empty(link))?;
    w.write_event(Event::End(BytesEnd::new("head")))?;

    w.write_event(Event::Start(BytesStart::new("body")))?;
    w.write_event(Event::Start(BytesStart::new("h1")))?;
    w.write_event(Event::Text(BytesText::new(title)))?;
    w.write_event(Event::End(BytesEnd::new("h1")))?;

    for para in paragraphs {
        w.write_event(Event::Start(BytesStart::new("p")))?;
        for (i, line) in para.iter().enumerate() {
            if i > 0 {
                w.write_event(Event::Empty(BytesStart::new("br")))?;
            }
            w.write_event(Event::Text(BytesText::new(line)))?;
        }
        w.write_event(Event::End(BytesEnd::new("p")))?;
    }

    w.write_event(Event::End(BytesEnd::new("body")))?;
    w.write_event(Event::End(BytesEnd::new("html")))?;
    finish(w)
}

/// 封面页 XHTML。
pub fn build_cover_xhtml(img_rel: &str) -> Result<String> {
    let mut w = new_writer();
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    w.write_event(Event::DocType(BytesText::from_escaped("html")))?;

    let mut html = BytesStart::new("html");
    html.push_attribute(("xmlns", XHTML_NS));
    w.write_event(Event::Start(html))?;

    w.write_event(Event::Start(BytesStart::new("head")))?;
    w.write_event(Event::Start(BytesStart::new("title")))?;
    w.write_event(Event::Text(BytesText::new("Cover")))?;
    w.write_event(Event::End(BytesEnd::new("title")))?;
    w.write_event(Event::Start(BytesStart::new("style")))?;
    w.write_event(Event::Text(BytesText::new(
        "html,body{margin:0;padding:0}img{max-width:100%;height:auto;display:block;margin:0 auto}",
    )))?;
    w.write_event(Event::End(BytesEnd::new("style")))?;
    w.write_event(Event::End(BytesEnd::new("head")))?;

    w.write_event(Event::Start(BytesStart::new("body")))?;
    let mut img = BytesStart::new("img");
    img.push_attribute(("src", format!("../{img_rel}").as_str()));
    img.push_attribute(("alt", "Cover"));
    w.write_event(Event::Empty(img))?;
    w.write_event(Event::End(BytesEnd::new("body")))?;
    w.write_event(Event::End(BytesEnd::new("html")))?;
    finish(w)
}

/// `META-INF/container.xml`：指向 `OEBPS/content.opf`。
pub fn build_container_xml() -> Result<String> {
    let mut w = new_writer();
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut container = BytesStart::new("container");
    container.push_attribute(("version", "1.0"));
    container.push_attribute(("xmlns", "urn:oasis:names:tc:opendocument:xmlns:container"));
    w.write_event(Event::Start(container))?;

    w.write_event(Event::Start(BytesStart::new("rootfiles")))?;
    let mut rootfile = BytesStart::new("rootfile");
    rootfile.push_attribute(("full-path", "OEBPS/content.opf"));
    rootfile.push_attribute(("media-type", "application/oebps-package+xml"));
    w.write_event(Event::Empty(rootfile))?;
    w.write_event(Event::End(BytesEnd::new("rootfiles")))?;

    w.write_event(Event::End(BytesEnd::new("container")))?;
    finish(w)
}

/// `OEBPS/content.opf`：DC 元数据 + manifest + spine。
#[allow(clippy::too_many_arguments)]
pub fn build_content_opf(
    title: &str,
    author: &str,
    language: &str,
    uid: &str,
    date_utc: &str,
    manifest: &[ManifestItem],
    spine: &[String],
    cover_id: Option<&str>,
    extras: &OpfExtras,
) -> Result<String> {
    let mut w = new_writer();
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut package = BytesStart::new("package");
    package.push_attribute(("xmlns", "http://www.idpf.org/2007/opf"));
    package.push_attribute(("unique-identifier", "BookID"));
    package.push_attribute(("version", "2.0"));
    w.write_event(Event::Start(package))?;

    let mut metadata = BytesStart::new("metadata");
    metadata.push_attribute(("xmlns:dc", "http://purl.org/dc/elements/1.1/"));
    metadata.push_attribute(("xmlns:opf", "http://www.idpf.org/2007/opf"));
    w.write_event(Event::Start(metadata))?;

    text_element(&mut w, "dc:title", title, &[])?;
    text_element(&mut w, "dc:creator", author, &[("opf:role", "aut")])?;
    text_element(&mut w, "dc:language", language, &[])?;
    text_element(&mut w, "dc:identifier", &format!("urn:uuid:{uid}"), &[("id", "BookID")])?;
    text_element(&mut w, "dc:date", date_utc, &[])?;

    if let Some(cover_id) = cover_id {
        let mut meta = BytesStart::new("meta");
        meta.push_attribute(("name", "cover"));
        meta.push_attribute(("content", cover_id));
        w.write_event(Event::Empty(meta))?;
    }
    if let Some(publisher) = &extras.publisher {
        text_element(&mut w, "dc:publisher", publisher, &[])?;
    }
    if let Some(description) = &extras.description {
        text_element(&mut w, "dc:description", description, &[])?;
    }
    if let Some(series) = &extras.series {
        let mut meta = BytesStart::new("meta");
        meta.push_attribute(("name", "calibre:series"));
        meta.push_attribute(("content", series.as_str()));
        w.write_event(Event::Empty(meta))?;
    }
    if let Some(series_index) = extras.series_index {
        let mut meta = BytesStart::new("meta");
        meta.push_attribute(("name", "calibre:series_index"));
        meta.push_attribute(("content", series_index.to_string().as_str()));
        w.write_event(Event::Empty(meta))?;
    }
    w.write_event(Event::End(BytesEnd::new("metadata")))?;

    w.write_event(Event::Start(BytesStart::new("manifest")))?;
    for item in manifest {
        let mut el = BytesStart::new("item");
        el.push_attribute(("id", item.id.as_str()));
        el.push_attribute(("href", item.href.as_str()));
        el.push_attribute(("media-type", item.media_type.as_str()));
        w.write_event(Event::Empty(el))?;
    }
    w.write_event(Event::End(BytesEnd::new("manifest")))?;

    let mut spine_el = BytesStart::new("spine");
    spine_el.push_attribute(("toc", "ncx"));
    w.write_event(Event::Start(spine_el))?;
    for idref in spine {
        let mut el = BytesStart::new("itemref");
        el.push_attribute(("idref", idref.as_str()));
        w.write_event(Event::Empty(el))?;
    }
    w.write_event(Event::End(BytesEnd::new("spine")))?;

    w.write_event(Event::End(BytesEnd::new("package")))?;
    finish(w)
}

/// `OEBPS/toc.ncx`：每章一个 navPoint，playOrder 从 1 起。
pub fn build_toc_ncx(title: &str, author: &str, uid: &str, nav: &[NavPoint]) -> Result<String> {
    let mut w = new_writer();
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    w.write_event(Event::DocType(BytesText::from_escaped(
        "ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\"",
    )))?;

    let mut ncx = BytesStart::new("ncx");
    ncx.push_attribute(("xmlns", "http://www.daisy.org/z3986/2005/ncx/"));
    ncx.push_attribute(("version", "2005-1"));
    w.write_event(Event::Start(ncx))?;

    w.write_event(Event::Start(BytesStart::new("head")))?;
    for (name, content) in [
        ("dtb:uid", format!("urn:uuid:{uid}")),
        ("dtb:depth", "1".to_string()),
        ("dtb:totalPageCount", "0".to_string()),
        ("dtb:maxPageNumber", "0".to_string()),
    ] {
        let mut meta = BytesStart::new("meta");
        meta.push_attribute(("name", name));
        meta.push_attribute(("content", content.as_str()));
        w.write_event(Event::Empty(meta))?;
    }
    w.write_event(Event::End(BytesEnd::new("head")))?;

    w.write_event(Event::Start(BytesStart::new("docTitle")))?;
    text_element(&mut w, "text", title, &[])?;
    w.write_event(Event::End(BytesEnd::new("docTitle")))?;
    w.write_event(Event::Start(BytesStart::new("docAuthor")))?;
    text_element(&mut w, "text", author, &[])?;
    w.write_event(Event::End(BytesEnd::new("docAuthor")))?;

    w.write_event(Event::Start(BytesStart::new("navMap")))?;
    for point in nav {
        let mut np = BytesStart::new("navPoint");
        np.push_attribute(("id", point.id.as_str()));
        np.push_attribute(("playOrder", point.play_order.to_string().as_str()));
        w.write_event(Event::Start(np))?;
        w.write_event(Event::Start(BytesStart::new("navLabel")))?;
        text_element(&mut w, "text", &point.label, &[])?;
        w.write_event(Event::End(BytesEnd::new("navLabel")))?;
        let mut content = BytesStart::new("content");
        content.push_attribute(("src", point.src.as_str()));
        w.write_event(Event::Empty(content))?;
        w.write_event(Event::End(BytesEnd::new("navPoint")))?;
    }
    w.write_event(Event::End(BytesEnd::new("navMap")))?;

    w.write_event(Event::End(BytesEnd::new("ncx")))?;
    finish(w)
}

fn text_element(
    w: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
    attrs: &[(&str, &str)],
) -> Result<()> {
    let mut el = BytesStart::new(name);
    for (k, v) in attrs {
        el.push_attribute((*k, *v));
    }
    w.write_event(Event::Start(el))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_group_on_blank_lines() {
        let text = "line one\nline two\n\nline three\n\n\nline four";
        let paras = paragraph_lines(text);
        assert_eq!(paras.len(), 3);
        assert_eq!(paras[0], vec!["line one", "line two"]);
        assert_eq!(paras[1], vec!["line three"]);
    }

    #[test]
    fn chapter_xhtml_escapes_title() {
        let out = build_chap_xhtml("War & Peace <1>", &[vec!["a & b".to_string()]]).unwrap();
        assert!(out.contains("<title>War &amp; Peace &lt;1&gt;</title>"));
        assert!(out.contains("<p>a &amp; b</p>"));
        assert!(out.contains(r#"<html xmlns="http://www.w3.org/1999/xhtml">"#));
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
    }

    #[test]
    fn chapter_xhtml_joins_lines_with_br() {
        let out =
            build_chap_xhtml("T", &[vec!["one".to_string(), "two".to_string()]]).unwrap();
        assert!(out.contains("<p>one<br/>two</p>"));
    }

    #[test]
    fn container_points_at_opf() {
        let out = build_container_xml().unwrap();
        assert!(out.contains(r#"full-path="OEBPS/content.opf""#));
        assert!(out.contains("urn:oasis:names:tc:opendocument:xmlns:container"));
    }

    #[test]
    fn opf_carries_dc_metadata() {
        let manifest = vec![ManifestItem {
            id: "ncx".into(),
            href: "toc.ncx".into(),
            media_type: "application/x-dtbncx+xml".into(),
        }];
        let spine = vec!["chap1".to_string()];
        let out = build_content_opf(
            "Cultivation Supreme",
            "Unknown Author",
            "en",
            "0000-1111",
            "2024-01-01T00:00:00Z",
            &manifest,
            &spine,
            None,
            &OpfExtras::default(),
        )
        .unwrap();
        assert!(out.contains("<dc:title>Cultivation Supreme</dc:title>"));
        assert!(out.contains(r#"<dc:creator opf:role="aut">Unknown Author</dc:creator>"#));
        assert!(out.contains("<dc:identifier id=\"BookID\">urn:uuid:0000-1111</dc:identifier>"));
        assert!(out.contains(r#"<itemref idref="chap1"/>"#));
    }

    #[test]
    fn ncx_playorder_starts_at_one() {
        let nav = vec![
            NavPoint {
                id: "nav1".into(),
                play_order: 1,
                label: "Chapter 1".into(),
                src: "Text/chapter1.xhtml".into(),
            },
            NavPoint {
                id: "nav2".into(),
                play_order: 2,
                label: "Chapter 2".into(),
                src: "Text/chapter2.xhtml".into(),
            },
        ];
        let out = build_toc_ncx("T", "A", "u", &nav).unwrap();
        assert!(out.contains(r#"playOrder="1""#));
        assert!(out.contains(r#"playOrder="2""#));
        assert!(out.contains("<text>Chapter 1</text>"));
    }

    #[test]
    fn html_strip_and_unescape() {
        let out = strip_html_unescape("<p>Tom &amp; Jerry</p><br/>");
        assert_eq!(out, "Tom & Jerry");
    }
}
