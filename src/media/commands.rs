use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

/// One ffmpeg/ffprobe invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    pub fn quiet(self) -> Self {
        self.arg("-v").arg("error")
    }

    /// Select one input stream by absolute index
    pub fn map_stream(self, index: u32) -> Self {
        self.arg("-map").arg(format!("0:{}", index))
    }

    pub fn subtitle_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:s").arg(codec)
    }

    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    pub fn no_audio(self) -> Self {
        self.arg("-an")
    }

    /// Run to completion; a non-zero exit is a media error carrying stderr
    pub async fn execute(&self) -> Result<()> {
        self.run().await.map(|_| ())
    }

    /// Run to completion and return stdout
    pub async fn output_text(&self) -> Result<String> {
        let stdout = self.run().await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn run(&self) -> Result<Vec<u8>> {
        debug!("Executing media command: {} {:?}", self.binary_path, self.args);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Media(format!("{} failed: {}", self.description, stderr.trim())));
        }

        Ok(output.stdout)
    }
}

/// Builds the ffmpeg and ffprobe command lines used by the built-in collaborators
#[derive(Debug, Clone)]
pub struct MediaCommandBuilder {
    ffmpeg: String,
    ffprobe: String,
}

impl MediaCommandBuilder {
    pub fn new<S1: Into<String>, S2: Into<String>>(ffmpeg: S1, ffprobe: S2) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Re-encode a subtitle file; the output format follows the output extension
    pub fn convert_subtitle<P: AsRef<Path>>(&self, input: P, output: P) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg, "Subtitle conversion")
            .quiet()
            .overwrite()
            .input(input)
            .output(output)
    }

    /// List subtitle streams as JSON
    pub fn probe_subtitle_streams<P: AsRef<Path>>(&self, video: P) -> MediaCommand {
        MediaCommand::new(&self.ffprobe, "Subtitle stream probe")
            .quiet()
            .args(["-select_streams", "s"])
            .args(["-show_entries", "stream=index,codec_name:stream_tags=language"])
            .args(["-of", "json"])
            .output(video)
    }

    /// Extract one subtitle stream as SRT
    pub fn extract_subtitle_stream<P: AsRef<Path>>(&self, video: P, index: u32, output: P) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg, format!("Subtitle extraction (stream {})", index))
            .quiet()
            .overwrite()
            .input(video)
            .map_stream(index)
            .no_video()
            .no_audio()
            .subtitle_codec("srt")
            .output(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_maps_one_stream_to_srt() {
        let builder = MediaCommandBuilder::new("ffmpeg", "ffprobe");
        let cmd = builder.extract_subtitle_stream(Path::new("ep01.mkv"), 3, Path::new("out/ep01_3.srt"));
        assert_eq!(cmd.binary_path, "ffmpeg");
        assert_eq!(
            cmd.args,
            vec![
                "-v", "error", "-y", "-i", "ep01.mkv", "-map", "0:3", "-vn", "-an", "-c:s", "srt",
                "out/ep01_3.srt"
            ]
        );
    }

    #[test]
    fn probe_requests_json() {
        let builder = MediaCommandBuilder::new("/opt/ffmpeg", "/opt/ffprobe");
        let cmd = builder.probe_subtitle_streams(Path::new("movie.mp4"));
        assert_eq!(cmd.binary_path, "/opt/ffprobe");
        assert!(cmd.args.windows(2).any(|w| w == ["-of", "json"]));
        assert_eq!(cmd.args.last().map(String::as_str), Some("movie.mp4"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_media_error() {
        let cmd = MediaCommand::new("/nonexistent/ffmpeg", "Version check").arg("-version");
        assert!(matches!(cmd.execute().await, Err(SyncError::Media(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_carries_stderr() {
        let cmd = MediaCommand::new("/bin/sh", "Failing step").args(["-c", "echo broken >&2; exit 1"]);
        let err = cmd.execute().await.unwrap_err().to_string();
        assert!(err.contains("Failing step failed: broken"));
    }
}
