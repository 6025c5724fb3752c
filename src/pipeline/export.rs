//! Score export: MusicXML first, then the optional native format.
//!
//! The combined MusicXML is the primary artifact. It is serialised with
//! `quick-xml` from the merged document and written atomically (temp file +
//! rename) so a crash never leaves a truncated score behind. Serialisation is
//! byte-for-byte deterministic: no timestamps, stable attribute order.
//!
//! The native format is produced afterwards from the written MusicXML file
//! by a [`NativeConverter`]. Its failure is recorded on the
//! [`ExportReport`] and never touches the MusicXML.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use roxmltree::{Document, ParsingOptions};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ConversionConfig, NativeFormat};
use crate::error::ExportError;
use crate::notation::{XmlElement, XmlNode};
use crate::output::ExportReport;
use crate::pipeline::merge::{MergedDocument, MergedMeasure};

const MUSICXML_VERSION: &str = "4.0";
const MUSICXML_DOCTYPE: &str = r#"score-partwise PUBLIC "-//Recordare//DTD MusicXML 4.0 Partwise//EN" "http://www.musicxml.org/dtds/partwise.dtd""#;
const MSCX_VERSION: &str = "4.20";
const SOFTWARE: &str = concat!("pdf2muse ", env!("CARGO_PKG_VERSION"));

fn xml_err(e: quick_xml::Error) -> ExportError {
    ExportError::Serialize {
        detail: e.to_string(),
    }
}

fn start_document(writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<(), ExportError> {
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("no"))))
        .map_err(xml_err)
}

fn open(writer: &mut Writer<Cursor<Vec<u8>>>, start: BytesStart<'_>) -> Result<(), ExportError> {
    writer.write_event(Event::Start(start)).map_err(xml_err)
}

fn close(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str) -> Result<(), ExportError> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> Result<String, ExportError> {
    let mut bytes = writer.into_inner().into_inner();
    bytes.push(b'\n');
    String::from_utf8(bytes).map_err(|e| ExportError::Serialize {
        detail: e.to_string(),
    })
}

/// Serialise the whole merged score as partwise MusicXML.
///
/// The first measure of every page after the first carries a
/// `<print new-page="yes"/>` so the printed page layout survives.
pub fn to_musicxml(doc: &MergedDocument) -> Result<String, ExportError> {
    write_score(doc, |_| true, true)
}

/// Serialise only the measures recognised on `page_index`.
pub fn page_to_musicxml(doc: &MergedDocument, page_index: usize) -> Result<String, ExportError> {
    write_score(doc, |m| m.source_page == page_index, false)
}

fn write_score(
    doc: &MergedDocument,
    keep: impl Fn(&MergedMeasure) -> bool,
    page_breaks: bool,
) -> Result<String, ExportError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    start_document(&mut writer)?;
    writer
        .write_event(Event::DocType(BytesText::from_escaped(MUSICXML_DOCTYPE)))
        .map_err(xml_err)?;

    let mut root = BytesStart::new("score-partwise");
    root.push_attribute(("version", MUSICXML_VERSION));
    open(&mut writer, root)?;

    if let Some(title) = &doc.title {
        let mut work = XmlElement::new("work");
        work.children
            .push(XmlNode::Element(XmlElement::with_text("work-title", title.as_str())));
        work.write(&mut writer).map_err(xml_err)?;
    }

    let mut encoding = XmlElement::new("encoding");
    encoding
        .children
        .push(XmlNode::Element(XmlElement::with_text("software", SOFTWARE)));
    let mut identification = XmlElement::new("identification");
    identification.children.push(XmlNode::Element(encoding));
    identification.write(&mut writer).map_err(xml_err)?;

    let parts: Vec<_> = doc
        .parts
        .iter()
        .map(|p| (p, p.measures.iter().filter(|m| keep(m)).collect::<Vec<_>>()))
        .filter(|(_, measures)| measures.iter().any(|m| !m.padded))
        .collect();

    let mut part_list = XmlElement::new("part-list");
    for (part, _) in &parts {
        let score_part = part.score_part.clone().unwrap_or_else(|| {
            let mut sp = XmlElement::new("score-part");
            sp.set_attr("id", part.id.clone());
            sp.children.push(XmlNode::Element(XmlElement::with_text(
                "part-name",
                part.name.clone().unwrap_or_default(),
            )));
            sp
        });
        part_list.children.push(XmlNode::Element(score_part));
    }
    part_list.write(&mut writer).map_err(xml_err)?;

    for (part, measures) in &parts {
        let mut start = BytesStart::new("part");
        start.push_attribute(("id", part.id.as_str()));
        open(&mut writer, start)?;

        let mut previous_page = None;
        for measure in measures {
            let new_page = previous_page.is_some_and(|p| p != measure.source_page);
            previous_page = Some(measure.source_page);
            if page_breaks && new_page && measure.element.child("print").is_none() {
                let mut element = measure.element.clone();
                let mut print = XmlElement::new("print");
                print.set_attr("new-page", "yes");
                element.children.insert(0, XmlNode::Element(print));
                element.write(&mut writer).map_err(xml_err)?;
            } else {
                measure.element.write(&mut writer).map_err(xml_err)?;
            }
        }
        close(&mut writer, "part")?;
    }

    close(&mut writer, "score-partwise")?;
    finish(writer)
}

/// Wrap a MusicXML document's part list and parts in a MuseScore 4 `.mscx` shell.
pub fn musicxml_to_mscx(musicxml: &str) -> Result<String, ExportError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let parsed = Document::parse_with_options(musicxml, options).map_err(|e| {
        ExportError::Serialize {
            detail: format!("MusicXML could not be re-read: {e}"),
        }
    })?;
    let root = parsed.root_element();

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    start_document(&mut writer)?;
    let mut shell = BytesStart::new("museScore");
    shell.push_attribute(("version", MSCX_VERSION));
    open(&mut writer, shell)?;
    open(&mut writer, BytesStart::new("Score"))?;

    let mut meta = XmlElement::with_text("metaTag", "pdf2muse");
    meta.set_attr("name", "source");
    meta.write(&mut writer).map_err(xml_err)?;

    for node in root
        .children()
        .filter(|n| n.has_tag_name("part-list") || n.has_tag_name("part"))
    {
        XmlElement::from_node(node)
            .write(&mut writer)
            .map_err(xml_err)?;
    }

    close(&mut writer, "Score")?;
    close(&mut writer, "museScore")?;
    finish(writer)
}

/// Write `contents` to `path` via a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ExportError> {
    let write_err = |source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await.map_err(write_err)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(e));
    }
    Ok(())
}

/// Produces the native score format from a written MusicXML file.
#[async_trait]
pub trait NativeConverter: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &str;

    /// File extension of the produced file, without the dot.
    fn extension(&self) -> &str {
        "mscx"
    }

    async fn convert(&self, musicxml: &Path, target: &Path) -> Result<(), ExportError>;
}

/// In-process `.mscx` wrapper around the MusicXML parts.
///
/// MuseScore imports the result but the layout is its own; use
/// [`MuseScoreCli`] for a faithful conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct MscxWrapper;

#[async_trait]
impl NativeConverter for MscxWrapper {
    fn name(&self) -> &str {
        "mscx-wrapper"
    }

    async fn convert(&self, musicxml: &Path, target: &Path) -> Result<(), ExportError> {
        let xml = tokio::fs::read_to_string(musicxml)
            .await
            .map_err(|e| ExportError::Converter {
                converter: self.name().to_string(),
                detail: format!("{}: {e}", musicxml.display()),
            })?;
        let mscx = musicxml_to_mscx(&xml)?;
        write_atomic(target, mscx.as_bytes()).await
    }
}

/// Converts through a local MuseScore installation (`mscore -o out.mscx in.musicxml`).
#[derive(Debug, Clone)]
pub struct MuseScoreCli {
    pub executable: String,
    pub timeout: Duration,
}

impl MuseScoreCli {
    pub fn new(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }
}

#[async_trait]
impl NativeConverter for MuseScoreCli {
    fn name(&self) -> &str {
        &self.executable
    }

    async fn convert(&self, musicxml: &Path, target: &Path) -> Result<(), ExportError> {
        let converter_err = |detail: String| ExportError::Converter {
            converter: self.executable.clone(),
            detail,
        };
        let child = Command::new(&self.executable)
            .arg("-o")
            .arg(target)
            .arg(musicxml)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| converter_err(format!("could not start: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| converter_err(e.to_string()))?,
            Err(_) => {
                return Err(ExportError::ConverterTimeout {
                    converter: self.executable.clone(),
                    secs: self.timeout.as_secs(),
                })
            }
        };
        if !output.status.success() {
            return Err(converter_err(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if tokio::fs::metadata(target).await.is_err() {
            return Err(converter_err(format!("{} was not created", target.display())));
        }
        Ok(())
    }
}

/// The converter configured by `format`, if any.
pub fn converter_for(format: &NativeFormat, timeout: Duration) -> Option<Arc<dyn NativeConverter>> {
    match format {
        NativeFormat::None => None,
        NativeFormat::MscxWrapper => Some(Arc::new(MscxWrapper)),
        NativeFormat::MuseScoreCli { executable } => {
            Some(Arc::new(MuseScoreCli::new(executable.clone(), timeout)))
        }
    }
}

/// Write every configured output for `doc` into `config.output_dir`.
///
/// Only a failed MusicXML write is an error. Per-page and native failures
/// come after it and are recorded on the returned report.
pub async fn export(
    doc: &MergedDocument,
    config: &ConversionConfig,
    native: Option<Arc<dyn NativeConverter>>,
) -> Result<ExportReport, ExportError> {
    let mut report = ExportReport::default();
    let dir = &config.output_dir;
    let stem = &config.output_stem;

    let musicxml_path = dir.join(format!("{stem}.musicxml"));
    let xml = to_musicxml(doc)?;
    write_atomic(&musicxml_path, xml.as_bytes()).await?;
    info!("Wrote {}", musicxml_path.display());
    report.musicxml = Some(musicxml_path.clone());

    if config.per_page_output {
        for &page in &doc.pages {
            let path = dir.join(format!("{stem}_page_{:03}.musicxml", page + 1));
            let written = match page_to_musicxml(doc, page) {
                Ok(xml) => write_atomic(&path, xml.as_bytes()).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {
                    debug!("Wrote {}", path.display());
                    report.page_files.push(path);
                }
                Err(e) => {
                    warn!("Page {} export failed: {e}", page + 1);
                    report.page_errors.push(e.to_string());
                }
            }
        }
    }

    if let Some(converter) = native {
        let target = dir.join(format!("{stem}.{}", converter.extension()));
        match converter.convert(&musicxml_path, &target).await {
            Ok(()) => {
                info!("Wrote {} via {}", target.display(), converter.name());
                report.native = Some(target);
            }
            Err(e) => {
                warn!("Native export failed (MusicXML kept): {e}");
                report.native_error = Some(e.to_string());
            }
        }
    }

    Ok(report)
}
