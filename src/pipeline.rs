use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::album::AlbumSource;
use crate::chat::{ChatClient, ChatReply};
use crate::classify::{
    AssetCategory, ClassificationRejection, Classifier, MIN_TRAILER_WIDTH, audio_channels_tag,
    path_exclusion,
};
use crate::config::Config;
use crate::error::{Result, ReelgateError};
use crate::executor::CategoryExecutor;
use crate::media::{MediaCommandBuilder, OUTPUT_FPS, Transcoder};
use crate::probe::MediaProber;
use crate::requests::{RequestManager, RequestStore, TrailerResolution};
use crate::watch::FileHandler;

/// Pause before polling again after a failed reply poll.
const REPLY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How one file left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Ineligible(String),
    Rejected(ClassificationRejection),
    MovieSkipped(String),
    MovieTranscoded,
    AwaitingApproval,
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ineligible(reason) => write!(f, "ineligible ({})", reason),
            Self::Rejected(rejection) => write!(f, "rejected ({})", rejection),
            Self::MovieSkipped(reason) => write!(f, "movie skipped ({})", reason),
            Self::MovieTranscoded => f.write_str("movie transcoded"),
            Self::AwaitingApproval => f.write_str("awaiting approval"),
        }
    }
}

/// Per-file flow: probe, classify, then transcode a movie or open an approval
/// request for a trailer.
pub struct Pipeline {
    config: Arc<Config>,
    classifier: Classifier,
    commands: MediaCommandBuilder,
    prober: Arc<dyn MediaProber>,
    transcoder: Arc<dyn Transcoder>,
    chat: Arc<dyn ChatClient>,
    executor: Arc<CategoryExecutor>,
    requests: Arc<RequestManager>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        prober: Arc<dyn MediaProber>,
        transcoder: Arc<dyn Transcoder>,
        chat: Arc<dyn ChatClient>,
        albums: Arc<dyn AlbumSource>,
    ) -> Self {
        let requests = RequestManager::new(
            Arc::new(RequestStore::new()),
            chat.clone(),
            albums,
            config.screenshots.clone(),
        );

        Self {
            classifier: Classifier::new(config.pipeline.require_mixed_audio),
            commands: MediaCommandBuilder::new(&config.media.transcoder_path, &config.media.ffmpeg_path),
            config,
            prober,
            transcoder,
            chat,
            executor: Arc::new(CategoryExecutor::new()),
            requests: Arc::new(requests),
        }
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.requests
    }

    pub async fn process_file(&self, path: &Path) -> Result<FileOutcome> {
        if let Some(exclusion) = path_exclusion(path) {
            return Ok(FileOutcome::Ineligible(exclusion.to_string()));
        }

        let probe = self.prober.probe(path).await?;
        let size = fs::metadata(path).await?.len();

        let category = match self.classifier.classify(path, &probe, size) {
            Ok(category) => category,
            Err(rejection) => return Ok(FileOutcome::Rejected(rejection)),
        };
        info!(
            file = %path.display(),
            %category,
            duration = probe.duration,
            size,
            "Classified"
        );

        match category {
            AssetCategory::Movie => self.process_movie(path, probe.video_stream().map(|v| v.width)).await,
            AssetCategory::Trailer => {
                self.requests.request_approval(path).await?;
                Ok(FileOutcome::AwaitingApproval)
            }
            AssetCategory::Ineligible => Ok(FileOutcome::Ineligible("classified ineligible".to_string())),
        }
    }

    async fn process_movie(&self, path: &Path, width: Option<u32>) -> Result<FileOutcome> {
        if !self.config.pipeline.process_movies {
            return Ok(FileOutcome::MovieSkipped("movie processing is disabled".to_string()));
        }

        // the HD render only scales down
        let width = width.unwrap_or_default();
        if width < MIN_TRAILER_WIDTH {
            return Ok(FileOutcome::MovieSkipped(format!(
                "source is {} px wide, below {}",
                width, MIN_TRAILER_WIDTH
            )));
        }

        let paths = &self.config.paths;
        let outputs = MediaCommandBuilder::movie_outputs(path, &paths.edit_cache, &paths.buffer_in);
        let command = self.commands.movie(path, &outputs);

        self.executor
            .run_exclusive(AssetCategory::Movie, || self.transcoder.run(&command))
            .await?;

        info!(file = %path.display(), video = %outputs.video.display(), "Movie transcoded");
        Ok(FileOutcome::MovieTranscoded)
    }

    /// Render an approved trailer and archive its source.
    ///
    /// Returns where the source ended up. Any failure marks the request failed.
    pub async fn finalize_trailer(&self, filename: &str, resolution: TrailerResolution) -> Result<PathBuf> {
        let state = self.requests.resolve(filename, resolution.clone()).await?;
        self.finish_trailer(filename, &state.source_path, &resolution).await
    }

    /// Render and archive a request that is already resolved.
    async fn finish_trailer(
        &self,
        filename: &str,
        source: &Path,
        resolution: &TrailerResolution,
    ) -> Result<PathBuf> {
        match self.render_trailer(filename, source, resolution).await {
            Ok(archived) => {
                self.requests.complete(filename).await?;
                Ok(archived)
            }
            Err(e) => {
                self.requests.fail(filename, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn render_trailer(
        &self,
        filename: &str,
        source: &Path,
        resolution: &TrailerResolution,
    ) -> Result<PathBuf> {
        // the file may have changed since it was classified
        let probe = self.prober.probe(source).await?;
        let video = probe.video_stream().ok_or(ClassificationRejection::NoVideoStream)?;
        let rate = video
            .frame_rate()
            .ok_or_else(|| ClassificationRejection::UnknownFrameRate(video.r_frame_rate.clone()))?;

        let audio = probe.audio_streams().nth(resolution.audio_stream).ok_or_else(|| {
            ReelgateError::Request(format!(
                "{} has no audio stream {}",
                filename, resolution.audio_stream
            ))
        })?;
        let channels = audio_channels_tag(audio).ok_or_else(|| {
            ReelgateError::Request(format!(
                "audio stream {} has {} channels, only 2.0 and 5.1 can be rendered",
                resolution.audio_stream, audio.channels
            ))
        })?;

        let outputs = MediaCommandBuilder::trailer_outputs(&resolution.name, channels, &self.config.paths.trailers_temp);
        let command = self.commands.trailer(
            source,
            resolution.audio_stream,
            rate.tempo_factor(f64::from(OUTPUT_FPS)),
            &outputs,
        );

        self.executor
            .run_exclusive(AssetCategory::Trailer, || async {
                self.requests.begin_transcoding(filename).await?;
                self.transcoder.run(&command).await
            })
            .await?;

        self.requests.begin_archiving(filename).await?;
        let done_dir = self.config.paths.trailer_done_dir(&resolution.name);
        move_into(source, &done_dir).await
    }

    /// Poll the chat for replies to status messages and finalize the matching
    /// trailers. Runs until the process exits.
    pub async fn listen_for_replies(self: Arc<Self>) {
        info!("Listening for approval replies");
        let mut offset = 0;

        loop {
            match self.chat.poll_replies(offset).await {
                Ok(batch) => {
                    offset = batch.next_offset;
                    for reply in batch.replies {
                        self.clone().handle_reply(reply).await;
                    }
                }
                Err(e) => {
                    warn!("Reply polling failed: {}", e);
                    tokio::time::sleep(REPLY_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle_reply(self: Arc<Self>, reply: ChatReply) {
        let Some(filename) = self.requests.store().find_by_status_message(reply.reply_to) else {
            debug!("Reply {} does not answer an open request", reply.message_id);
            return;
        };

        let Some(resolution) = TrailerResolution::parse_reply(&reply.text) else {
            warn!(file = %filename, "Reply {:?} does not contain a usable name", reply.text);
            return;
        };

        // the reply stays in the channel unless the request accepted it
        let state = match self.requests.resolve(&filename, resolution.clone()).await {
            Ok(state) => state,
            Err(e) => {
                warn!(file = %filename, "Reply {} not applied: {}", reply.message_id, e);
                return;
            }
        };

        if let Err(e) = self.chat.delete_message(reply.message_id).await {
            debug!("Could not delete reply {}: {}", reply.message_id, e);
        }

        tokio::spawn(async move {
            match self.finish_trailer(&filename, &state.source_path, &resolution).await {
                Ok(archived) => info!(file = %filename, "Trailer archived to {}", archived.display()),
                Err(e) => warn!(file = %filename, "Trailer finalize failed: {}", e),
            }
        });
    }
}

#[async_trait]
impl FileHandler for Pipeline {
    async fn handle(&self, path: &Path) -> Result<()> {
        let outcome = self.process_file(path).await?;
        match &outcome {
            FileOutcome::Rejected(_) | FileOutcome::MovieSkipped(_) => {
                warn!(file = %path.display(), "{}", outcome)
            }
            _ => info!(file = %path.display(), "{}", outcome),
        }
        Ok(())
    }
}

/// Move `source` into `dir`, keeping its file name.
async fn move_into(source: &Path, dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| ReelgateError::Request(format!("{} has no file name", source.display())))?;
    fs::create_dir_all(dir).await?;

    let target = dir.join(name);
    if fs::rename(source, &target).await.is_err() {
        // rename cannot cross filesystems
        fs::copy(source, &target).await?;
        fs::remove_file(source).await?;
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::{Album, MockAlbumSource, Screenshot};
    use crate::chat::{MessageId, MockChatClient};
    use crate::classify::tests::{trailer_probe, video};
    use crate::media::MockTranscoder;
    use crate::probe::MockMediaProber;
    use crate::requests::{RequestPhase, RequestState};
    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths.buffer_in = root.join("buffer_in");
        config.paths.edit_cache = root.join("edit_cache");
        config.paths.trailers_temp = root.join("trailers_temp");
        config.paths.trailers_in = root.join("trailers_in");
        config
    }

    fn pipeline(
        config: Config,
        prober: MockMediaProber,
        transcoder: MockTranscoder,
        chat: MockChatClient,
        albums: MockAlbumSource,
    ) -> Pipeline {
        Pipeline::new(
            Arc::new(config),
            Arc::new(prober),
            Arc::new(transcoder),
            Arc::new(chat),
            Arc::new(albums),
        )
    }

    fn silent_chat() -> MockChatClient {
        let mut chat = MockChatClient::new();
        chat.expect_send_message().never();
        chat.expect_send_album().never();
        chat
    }

    fn idle_albums() -> MockAlbumSource {
        let mut albums = MockAlbumSource::new();
        albums.expect_build_album().never();
        albums
    }

    fn idle_transcoder() -> MockTranscoder {
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_run().never();
        transcoder
    }

    #[tokio::test]
    async fn test_tagged_name_is_never_probed() {
        let mut prober = MockMediaProber::new();
        prober.expect_probe().never();

        let pipeline = pipeline(Config::default(), prober, idle_transcoder(), silent_chat(), idle_albums());
        let outcome = pipeline.process_file(Path::new("/in/X_s01e02_SER_00123.mp4")).await.unwrap();

        assert_eq!(outcome, FileOutcome::Ineligible("name is already tagged".to_string()));
    }

    #[tokio::test]
    async fn test_probe_failure_skips_file() {
        let mut prober = MockMediaProber::new();
        prober.expect_probe().times(1).returning(|path| {
            Err(ReelgateError::Probe {
                path: path.to_path_buf(),
                reason: "ffprobe exited with exit status: 1".to_string(),
            })
        });

        let pipeline = pipeline(Config::default(), prober, idle_transcoder(), silent_chat(), idle_albums());
        let result = pipeline.process_file(Path::new("/in/broken.mp4")).await;

        assert!(matches!(result, Err(ReelgateError::Probe { .. })));
        assert!(pipeline.requests().store().is_empty());
    }

    #[tokio::test]
    async fn test_no_video_stream_rejected_before_any_work() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.child("audio_only.mp4");
        file.write_binary(b"data").unwrap();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().times(1).returning(|_| {
            let mut probe = trailer_probe();
            probe.streams.remove(0);
            Ok(probe)
        });

        let pipeline = pipeline(config(tmp.path()), prober, idle_transcoder(), silent_chat(), idle_albums());
        let outcome = pipeline.process_file(file.path()).await.unwrap();

        assert_eq!(outcome, FileOutcome::Rejected(ClassificationRejection::NoVideoStream));
    }

    #[tokio::test]
    async fn test_long_file_takes_movie_path() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.child("Film.mkv");
        file.write_binary(b"data").unwrap();
        let cfg = config(tmp.path());
        let expected_video = cfg.paths.edit_cache.join("Film_HD.mp4").to_string_lossy().to_string();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().times(1).returning(|_| {
            let mut probe = trailer_probe();
            probe.duration = 9000.0;
            Ok(probe)
        });

        let mut transcoder = MockTranscoder::new();
        transcoder
            .expect_run()
            .withf(move |command| command.description == "Movie transcode" && command.args.contains(&expected_video))
            .times(1)
            .returning(|_| Ok(()));

        let pipeline = pipeline(cfg, prober, transcoder, silent_chat(), idle_albums());
        let outcome = pipeline.process_file(file.path()).await.unwrap();

        assert_eq!(outcome, FileOutcome::MovieTranscoded);
    }

    #[tokio::test]
    async fn test_narrow_movie_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.child("Old.avi");
        file.write_binary(b"data").unwrap();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().returning(|_| {
            let mut probe = trailer_probe();
            probe.duration = 5400.0;
            probe.streams[0] = video(720, 576, "25/1", "16:15");
            Ok(probe)
        });

        let pipeline = pipeline(config(tmp.path()), prober, idle_transcoder(), silent_chat(), idle_albums());
        let outcome = pipeline.process_file(file.path()).await.unwrap();

        assert!(matches!(outcome, FileOutcome::MovieSkipped(_)));
    }

    #[tokio::test]
    async fn test_movie_transcode_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.child("Film.mkv");
        file.write_binary(b"data").unwrap();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().returning(|_| {
            let mut probe = trailer_probe();
            probe.duration = 9000.0;
            Ok(probe)
        });
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_run().times(1).returning(|command| {
            Err(ReelgateError::ExternalProcess {
                description: command.description.clone(),
                reason: "exit status: 1".to_string(),
            })
        });

        let pipeline = pipeline(config(tmp.path()), prober, transcoder, silent_chat(), idle_albums());
        let result = pipeline.process_file(file.path()).await;

        assert!(matches!(result, Err(ReelgateError::ExternalProcess { .. })));
    }

    #[tokio::test]
    async fn test_trailer_scenario_requests_approval() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.child("Dune.mp4");
        // sparse 4.8 GB file
        std::fs::File::create(file.path()).unwrap().set_len(4_800_000_000).unwrap();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().times(1).returning(|_| Ok(trailer_probe()));

        let mut chat = MockChatClient::new();
        chat.expect_send_message().times(1).returning(|_| Ok(MessageId(7)));
        chat.expect_send_album()
            .withf(|photos| photos.len() == 5)
            .times(1)
            .returning(|photos| Ok((0..photos.len() as i64).map(|i| MessageId(8 + i)).collect()));

        let mut albums = MockAlbumSource::new();
        albums.expect_build_album().times(1).returning(|_, count, _| {
            Ok(Album {
                screenshots: (0..count)
                    .map(|i| Screenshot { offset: i as f64, jpeg: vec![i as u8; 4] })
                    .collect(),
            })
        });

        let pipeline = pipeline(config(tmp.path()), prober, idle_transcoder(), chat, albums);
        let outcome = pipeline.process_file(file.path()).await.unwrap();

        assert_eq!(outcome, FileOutcome::AwaitingApproval);
        let state = pipeline.requests().store().get("Dune.mp4").unwrap();
        assert_eq!(state.phase, RequestPhase::AwaitingUserInput);
        assert_eq!(state.photo_groups.len(), 5);
    }

    /// Pipeline with `Dune.mp4` already awaiting input.
    async fn awaiting_pipeline(tmp: &TempDir, transcoder: MockTranscoder, chat: MockChatClient) -> Pipeline {
        let mut albums = MockAlbumSource::new();
        albums.expect_build_album().returning(|_, count, _| {
            Ok(Album {
                screenshots: (0..count).map(|i| Screenshot { offset: i as f64, jpeg: vec![1] }).collect(),
            })
        });

        let mut prober = MockMediaProber::new();
        prober.expect_probe().returning(|_| {
            let mut probe = trailer_probe();
            probe.streams[0] = video(1920, 1080, "24/1", "1:1");
            Ok(probe)
        });

        let pipeline = pipeline(config(tmp.path()), prober, transcoder, chat, albums);
        pipeline.requests().request_approval(&tmp.path().join("buffer_in/Dune.mp4")).await.unwrap();
        pipeline
    }

    fn approval_chat() -> MockChatClient {
        let mut chat = MockChatClient::new();
        chat.expect_send_message().returning(|_| Ok(MessageId(1)));
        chat.expect_send_album().returning(|_| Ok(vec![MessageId(2)]));
        chat.expect_edit_message().returning(|_, _| Ok(()));
        chat
    }

    #[tokio::test]
    async fn test_finalize_renders_and_archives() {
        let tmp = TempDir::new().unwrap();
        tmp.child("buffer_in").create_dir_all().unwrap();
        let source = tmp.child("buffer_in/Dune.mp4");
        source.write_binary(b"trailer").unwrap();

        let mut transcoder = MockTranscoder::new();
        transcoder
            .expect_run()
            .withf(|command| {
                command.description == "Trailer transcode"
                    && command.args.contains(&"0:a:1".to_string())
                    && command.args.contains(&"aresample=48000,atempo=1.041667".to_string())
                    && command.args.iter().any(|a| a.ends_with("Dune_2024_TRL_AUDIORUS51.m4a"))
            })
            .times(1)
            .returning(|_| Ok(()));

        let pipeline = awaiting_pipeline(&tmp, transcoder, approval_chat()).await;
        let resolution = TrailerResolution { name: "Dune_2024".to_string(), audio_stream: 1 };
        let archived = pipeline.finalize_trailer("Dune.mp4", resolution).await.unwrap();

        assert_eq!(archived, tmp.path().join("trailers_in/_DONE/Dune_2024_TRL/Dune.mp4"));
        tmp.child("trailers_in/_DONE/Dune_2024_TRL/Dune.mp4").assert("trailer");
        assert!(!source.path().exists());
        assert!(pipeline.requests().store().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_failure_keeps_source() {
        let tmp = TempDir::new().unwrap();
        tmp.child("buffer_in").create_dir_all().unwrap();
        let source = tmp.child("buffer_in/Dune.mp4");
        source.write_binary(b"trailer").unwrap();

        let mut transcoder = MockTranscoder::new();
        transcoder.expect_run().times(1).returning(|command| {
            Err(ReelgateError::ExternalProcess {
                description: command.description.clone(),
                reason: "exit status: 1".to_string(),
            })
        });

        let pipeline = awaiting_pipeline(&tmp, transcoder, approval_chat()).await;
        let resolution = TrailerResolution { name: "Dune".to_string(), audio_stream: 0 };
        let result = pipeline.finalize_trailer("Dune.mp4", resolution.clone()).await;

        assert!(result.is_err());
        assert!(source.path().exists());
        assert!(pipeline.requests().store().is_empty());
        // the request is gone, so a second answer is refused
        assert!(pipeline.finalize_trailer("Dune.mp4", resolution).await.is_err());
    }

    #[tokio::test]
    async fn test_finalize_rejects_missing_audio_stream() {
        let tmp = TempDir::new().unwrap();
        tmp.child("buffer_in").create_dir_all().unwrap();
        tmp.child("buffer_in/Dune.mp4").write_binary(b"trailer").unwrap();

        let pipeline = awaiting_pipeline(&tmp, idle_transcoder(), approval_chat()).await;
        let resolution = TrailerResolution { name: "Dune".to_string(), audio_stream: 5 };

        assert!(pipeline.finalize_trailer("Dune.mp4", resolution).await.is_err());
        assert!(pipeline.requests().store().is_empty());
    }

    #[tokio::test]
    async fn test_reply_finalizes_matching_request() {
        let tmp = TempDir::new().unwrap();
        tmp.child("buffer_in").create_dir_all().unwrap();
        let source = tmp.child("buffer_in/Dune.mp4");
        source.write_binary(b"trailer").unwrap();

        let mut transcoder = MockTranscoder::new();
        transcoder.expect_run().times(1).returning(|_| Ok(()));

        let mut chat = approval_chat();
        chat.expect_delete_message()
            .withf(|message| *message == MessageId(99))
            .times(1)
            .returning(|_| Ok(()));

        let pipeline = Arc::new(awaiting_pipeline(&tmp, transcoder, chat).await);

        // unrelated reply is ignored
        pipeline
            .clone()
            .handle_reply(ChatReply { message_id: MessageId(98), reply_to: MessageId(50), text: "x".to_string() })
            .await;

        pipeline
            .clone()
            .handle_reply(ChatReply { message_id: MessageId(99), reply_to: MessageId(1), text: "Dune".to_string() })
            .await;

        let archived = tmp.child("trailers_in/_DONE/Dune_TRL/Dune.mp4");
        for _ in 0..200 {
            if archived.path().exists() && pipeline.requests().store().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(archived.path().exists());
        assert!(pipeline.requests().store().is_empty());
    }

    #[tokio::test]
    async fn test_reply_before_album_is_kept() {
        let mut chat = MockChatClient::new();
        chat.expect_delete_message().never();
        chat.expect_edit_message().never();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().never();

        let pipeline = Arc::new(pipeline(Config::default(), prober, idle_transcoder(), chat, idle_albums()));
        let mut state = RequestState::new(PathBuf::from("/in/Dune.mp4"));
        state.status_message = Some(MessageId(1));
        pipeline.requests().store().create("Dune.mp4", state).unwrap();

        pipeline
            .clone()
            .handle_reply(ChatReply { message_id: MessageId(99), reply_to: MessageId(1), text: "Dune".to_string() })
            .await;

        let state = pipeline.requests().store().get("Dune.mp4").unwrap();
        assert_eq!(state.phase, RequestPhase::Requested);
    }
}
