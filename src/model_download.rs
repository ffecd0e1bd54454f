use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow, bail};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

const POSE_MODEL_FILENAME: &str = "pose_estimation_coco17.onnx";
/// Environment variable holding a download URL for the pose model, if any.
pub const POSE_MODEL_URL_ENV: &str = "TRYON_POSE_MODEL_URL";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn default_pose_model_path() -> PathBuf {
    PathBuf::from("models").join(POSE_MODEL_FILENAME)
}

pub fn configured_pose_model_url() -> Option<String> {
    std::env::var(POSE_MODEL_URL_ENV)
        .ok()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelDownloadEvent {
    AlreadyPresent,
    Started { total: Option<u64> },
    Progress { downloaded: u64, total: Option<u64> },
    Finished,
}

/// Makes sure the pose model exists at `model_path`, downloading it from `url`
/// when it is missing and a URL is known. Progress goes to `on_event` and to a
/// terminal progress bar.
pub fn ensure_pose_model_ready<F>(
    model_path: &Path,
    url: Option<&str>,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    if model_path.is_file() {
        on_event(ModelDownloadEvent::AlreadyPresent);
        on_event(ModelDownloadEvent::Finished);
        return Ok(());
    }

    let Some(url) = url else {
        bail!(
            "pose model not found at {} and no download URL configured (set {})",
            model_path.display(),
            POSE_MODEL_URL_ENV
        );
    };

    if let Some(parent) = model_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let partial = model_path.with_extension("partial");
    let result = fetch(url, &partial, &mut on_event).and_then(|()| {
        fs::rename(&partial, model_path).with_context(|| {
            format!("failed to move {} to {}", partial.display(), model_path.display())
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result.with_context(|| format!("pose model download from {url} failed"))?;

    on_event(ModelDownloadEvent::Finished);
    log::info!("pose model saved to {}", model_path.display());
    Ok(())
}

/// Streams `url` into `dest`, reporting progress. Fails on short or empty bodies.
fn fetch<F>(url: &str, dest: &Path, on_event: &mut F) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!("downloading pose model from {url}");
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .context("request failed")?
        .error_for_status()
        .context("server refused the model request")?;

    let total = response.content_length();
    on_event(ModelDownloadEvent::Started { total });
    let bar = progress_bar(total);

    let file = fs::File::create(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let mut sink = ProgressWriter {
        inner: io::BufWriter::new(file),
        written: 0,
        total,
        bar: &bar,
        on_event,
    };
    io::copy(&mut response, &mut sink).context("transfer interrupted")?;
    let written = sink.written;
    let file = sink
        .inner
        .into_inner()
        .map_err(|err| anyhow!("failed to flush model file: {}", err.error()))?;
    file.sync_all().context("failed to sync model file")?;
    bar.finish_and_clear();

    match total {
        Some(expected) if expected != written => {
            bail!("received {written} of {expected} bytes")
        }
        _ if written == 0 => bail!("server sent an empty body"),
        _ => Ok(()),
    }
}

/// Writer adapter that forwards byte counts to the progress bar and callback.
struct ProgressWriter<'a, W, F> {
    inner: W,
    written: u64,
    total: Option<u64>,
    bar: &'a ProgressBar,
    on_event: &'a mut F,
}

impl<W: Write, F: FnMut(ModelDownloadEvent)> Write for ProgressWriter<'_, W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.bar.set_position(self.written);
        (self.on_event)(ModelDownloadEvent::Progress {
            downloaded: self.written,
            total: self.total,
        });
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    let (bar, template) = match total.filter(|&t| t > 0) {
        Some(total) => (
            ProgressBar::new(total),
            "{spinner:.green} pose model [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ),
        None => (ProgressBar::new_spinner(), "{spinner:.green} pose model {bytes}"),
    };
    match ProgressStyle::with_template(template) {
        Ok(style) => bar.set_style(style.progress_chars("=>-")),
        Err(err) => log::debug!("progress template rejected: {err}"),
    }
    if total.is_none() {
        bar.enable_steady_tick(Duration::from_millis(100));
    }
    bar
}
