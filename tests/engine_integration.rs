//! End-to-end tests through the Engine facade
//!
//! Inputs are synthesised 16-bit PCM WAV files written into a temp dir.

use mp3fy::audio::encoder::legal_bitrate;
use mp3fy::audio::muxer::FrameHeader;
use mp3fy::audio::{audio_payload_digest, decoded_audio_digest};
use mp3fy::{AlbumArt, Engine, EngineConfig, Mp3fyError, SessionState, INVALID_HANDLE};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn write_wav(path: &Path, sample_rate: u32, channels: u16, seconds: f32) {
    let frames = (sample_rate as f32 * seconds).round() as u32;
    let data_len = frames * channels as u32 * 2;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);

    // More than two channels needs WAVE_FORMAT_EXTENSIBLE with a channel mask
    let extensible = channels > 2;
    let fmt_len: u32 = if extensible { 40 } else { 16 };

    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(20 + fmt_len + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&fmt_len.to_le_bytes());
    bytes.extend_from_slice(&(if extensible { 0xFFFEu16 } else { 1 }).to_le_bytes());
    bytes.extend_from_slice(&channels.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
    bytes.extend_from_slice(&(channels * 2).to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    if extensible {
        bytes.extend_from_slice(&22u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        let mask: u32 = (1 << channels) - 1;
        bytes.extend_from_slice(&mask.to_le_bytes());
        // KSDATAFORMAT_SUBTYPE_PCM
        bytes.extend_from_slice(&[
            0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
        ]);
    }
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());

    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((t * 220.0 * std::f32::consts::TAU).sin() * 0.3 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
    }
    std::fs::write(path, bytes).unwrap();
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 255]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

fn fast_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.conversion.quality = mp3fy::EncodingQuality::Fast;
    Engine::new(config).unwrap()
}

/// First MPEG frame header of an MP3 file, skipping a leading ID3v2 tag
fn first_frame_header(path: &Path) -> FrameHeader {
    let bytes = std::fs::read(path).unwrap();
    let mut pos = 0;
    if bytes.starts_with(b"ID3") {
        let size = bytes[6..10].iter().fold(0usize, |acc, &b| (acc << 7) | (b & 0x7F) as usize);
        pos = 10 + size;
    }
    (pos..bytes.len() - 4)
        .find_map(|i| FrameHeader::parse(&bytes[i..]))
        .unwrap()
}

/// Convert `seconds` of 44.1 kHz stereo into `dir/name`
fn make_mp3(engine: &Engine, dir: &Path, name: &str, seconds: f32) -> std::path::PathBuf {
    let wav = dir.join(format!("{}.wav", name));
    let mp3 = dir.join(name);
    write_wav(&wav, 44_100, 2, seconds);
    let handle = engine.initialize(&wav, &mp3);
    assert_ne!(handle, INVALID_HANDLE);
    assert!(engine.convert(handle));
    engine.release(handle);
    mp3
}

#[test]
fn ten_second_wav_converts_with_matching_duration() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("song.wav");
    let output = dir.path().join("out.mp3");
    write_wav(&input, 44_100, 2, 10.0);

    let engine = Engine::with_defaults().unwrap();
    let handle = engine.initialize(&input, &output);
    assert_ne!(handle, INVALID_HANDLE);
    assert_eq!(engine.get_percentage(handle), 0);

    assert!(engine.convert(handle));
    assert_eq!(engine.get_percentage(handle), 100);
    assert_eq!(engine.session_status(handle).unwrap().state, SessionState::Succeeded);
    assert!(std::fs::metadata(&output).unwrap().len() > 0);

    let info = engine.get_audio_file_info(&output).unwrap();
    let drift = (info.duration_micros as i64 - 10_000_000).abs();
    assert!(drift <= 50_000, "duration {} us", info.duration_micros);
    assert!(info.bitrate_bps >= 180_000 && info.bitrate_bps <= 200_000, "{}", info.bitrate_bps);
}

#[test]
fn resampled_mono_input_keeps_duration() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("voice.wav");
    let output = dir.path().join("voice.mp3");
    write_wav(&input, 96_000, 1, 3.0);

    let engine = fast_engine();
    let handle = engine.initialize(&input, &output);
    assert!(engine.convert(handle));

    let info = engine.get_audio_file_info(&output).unwrap();
    let drift = (info.duration_micros as i64 - 3_000_000).abs();
    assert!(drift <= 60_000, "duration {} us", info.duration_micros);
}

#[test]
fn low_sample_rates_use_a_bitrate_the_rate_allows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    assert_eq!(engine.config().conversion.bitrate_kbps, 192);

    for (rate, channels) in [(8_000, 1), (11_025, 2), (16_000, 1), (22_050, 2), (32_000, 1)] {
        let input = dir.path().join(format!("in{}.wav", rate));
        let output = dir.path().join(format!("out{}.mp3", rate));
        write_wav(&input, rate, channels, 2.0);

        let handle = engine.initialize(&input, &output);
        assert!(engine.convert(handle), "{} Hz", rate);

        let header = first_frame_header(&output);
        assert_eq!(header.sample_rate, rate);
        assert_eq!(header.bitrate_kbps, legal_bitrate(rate, 192), "{} Hz", rate);

        let info = engine.get_audio_file_info(&output).unwrap();
        assert_eq!(info.sample_rate, rate);
        let frame_micros = header.samples_per_frame() as i64 * 1_000_000 / rate as i64;
        let drift = (info.duration_micros as i64 - 2_000_000).abs();
        // Encoder delay plus end padding stays under four frames
        assert!(drift <= 4 * frame_micros, "{} Hz: duration {} us", rate, info.duration_micros);
    }
}

#[test]
fn surround_input_is_folded_to_stereo() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("surround.wav");
    let output = dir.path().join("surround.mp3");
    write_wav(&input, 48_000, 6, 2.0);

    let engine = fast_engine();
    let handle = engine.initialize(&input, &output);
    assert_ne!(handle, INVALID_HANDLE);
    assert!(engine.convert(handle));

    let header = first_frame_header(&output);
    assert_eq!(header.sample_rate, 48_000);
    assert!(!header.mono);

    let info = engine.get_audio_file_info(&output).unwrap();
    assert_eq!(info.channels, 2);
    let drift = (info.duration_micros as i64 - 2_000_000).abs();
    assert!(drift <= 50_000, "duration {} us", info.duration_micros);
}

#[test]
fn damaged_frames_are_skipped_when_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let source = make_mp3(&engine, dir.path(), "source.mp3", 4.0);

    let mut bytes = std::fs::read(&source).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle..middle + 4_000].fill(0);
    let damaged = dir.path().join("damaged.mp3");
    std::fs::write(&damaged, bytes).unwrap();

    let mut config = EngineConfig::default();
    config.conversion.quality = mp3fy::EncodingQuality::Fast;
    config.conversion.skip_corrupt_packets = true;
    let tolerant = Engine::new(config).unwrap();

    let output = dir.path().join("recovered.mp3");
    let handle = tolerant.initialize(&damaged, &output);
    assert!(tolerant.convert(handle));
    assert_eq!(tolerant.get_percentage(handle), 100);

    let info = tolerant.get_audio_file_info(&output).unwrap();
    assert!(info.duration_micros >= 3_000_000, "duration {} us", info.duration_micros);
}

#[test]
fn second_convert_fails_and_keeps_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.mp3");
    write_wav(&input, 44_100, 2, 1.0);

    let engine = fast_engine();
    let handle = engine.initialize(&input, &output);
    assert!(engine.convert(handle));
    let first = std::fs::read(&output).unwrap();

    assert!(!engine.convert(handle));
    assert_eq!(std::fs::read(&output).unwrap(), first);
    assert_eq!(engine.get_percentage(handle), 100);
}

#[test]
fn missing_input_gives_invalid_handle_and_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.mp3");

    let engine = Engine::with_defaults().unwrap();
    assert_eq!(engine.initialize(dir.path().join("nope.wav"), &output), INVALID_HANDLE);
    assert!(!output.exists());
    assert!(matches!(
        engine.try_initialize(dir.path().join("nope.wav"), &output),
        Err(Mp3fyError::FileNotFound(_))
    ));
}

#[test]
fn unknown_and_released_handles() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    write_wav(&input, 44_100, 2, 0.2);

    let engine = Engine::with_defaults().unwrap();
    assert_eq!(engine.get_percentage(987_654_321_000), -1);
    assert_eq!(engine.get_percentage(INVALID_HANDLE), -1);

    let handle = engine.initialize(&input, dir.path().join("out.mp3"));
    assert!(engine.release(handle));
    assert!(!engine.release(handle));
    assert_eq!(engine.get_percentage(handle), -1);
    assert!(!engine.convert(handle));
}

#[test]
fn edit_title_round_trip_leaves_audio_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let a = make_mp3(&engine, dir.path(), "a.mp3", 2.0);
    let b = dir.path().join("b.mp3");

    assert!(engine.edit_metadata_information(&a, [("title", "X")], None, &b));

    let fields = engine.get_all_metadata(&b);
    assert_eq!(fields.get("title").map(String::as_str), Some("X"));
    assert_eq!(decoded_audio_digest(&a).unwrap(), decoded_audio_digest(&b).unwrap());
    assert_eq!(audio_payload_digest(&a).unwrap(), audio_payload_digest(&b).unwrap());
}

#[test]
fn edit_round_trip_returns_supported_fields() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let a = make_mp3(&engine, dir.path(), "a.mp3", 1.0);
    let b = dir.path().join("b.mp3");

    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), "Song".to_string());
    fields.insert("artist".to_string(), "Band".to_string());
    fields.insert("album".to_string(), "Record".to_string());
    fields.insert("track".to_string(), "3/12".to_string());
    fields.insert("composer".to_string(), "Writer".to_string());
    assert!(engine.edit_metadata_information(&a, fields.clone(), None, &b));

    let read = engine.get_all_metadata(&b);
    for (key, value) in &fields {
        assert_eq!(read.get(key), Some(value), "{}", key);
    }
}

#[test]
fn repeated_edits_produce_identical_tag_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let a = make_mp3(&engine, dir.path(), "a.mp3", 1.0);
    let b1 = dir.path().join("b1.mp3");
    let b2 = dir.path().join("b2.mp3");

    let fields = [("title", "Same"), ("artist", "Twice"), ("genre", "Test")];
    assert!(engine.edit_metadata_information(&a, fields, None, &b1));
    assert!(engine.edit_metadata_information(&a, fields, None, &b2));

    assert_eq!(std::fs::read(&b1).unwrap(), std::fs::read(&b2).unwrap());
}

#[test]
fn in_place_edit_is_safe() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let a = make_mp3(&engine, dir.path(), "a.mp3", 1.0);
    let before = decoded_audio_digest(&a).unwrap();

    assert!(engine.edit_metadata_information(&a, [("album", "Here")], None, &a));
    assert_eq!(engine.get_all_metadata(&a).get("album").map(String::as_str), Some("Here"));
    assert_eq!(decoded_audio_digest(&a).unwrap(), before);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("mp3fy-tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn album_art_is_embedded_as_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let a = make_mp3(&engine, dir.path(), "a.mp3", 1.0);
    let b = dir.path().join("b.mp3");
    assert!(engine.get_album_art(&a).is_none());

    let art = AlbumArt::from_encoded(png_bytes(16, 8)).unwrap();
    assert!(engine.edit_metadata_information(&a, [("title", "Cover")], Some(art), &b));

    let read = engine.get_album_art(&b).unwrap();
    assert_eq!((read.width, read.height), (16, 8));
    assert_eq!(read.encoding, mp3fy::audio::ImageEncoding::Jpeg);
    assert_eq!(read.pixels.len(), 16 * 8 * 4);

    let info = engine.get_audio_file_info(&b).unwrap();
    assert!(info.metadata.album_art.is_some());
    assert_eq!(info.metadata.fields.get("title").map(String::as_str), Some("Cover"));
}

#[test]
fn edit_with_missing_input_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::with_defaults().unwrap();
    let out = dir.path().join("b.mp3");

    assert!(!engine.edit_metadata_information(dir.path().join("a.mp3"), [("title", "X")], None, &out));
    assert!(!out.exists());
    assert!(engine.get_all_metadata(dir.path().join("a.mp3")).is_empty());
    assert!(engine.get_audio_file_info(dir.path().join("a.mp3")).is_none());
}

#[test]
fn tags_carry_over_from_input() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tagged.wav");
    let mp3 = dir.path().join("tagged.mp3");
    write_wav(&wav, 44_100, 2, 1.0);

    let engine = fast_engine();
    assert!(engine.edit_metadata_information(&wav, [("title", "Carried"), ("artist", "Over")], None, &wav));

    let handle = engine.initialize(&wav, &mp3);
    assert!(engine.convert(handle));
    let fields = engine.get_all_metadata(&mp3);
    assert_eq!(fields.get("title").map(String::as_str), Some("Carried"));
    assert_eq!(fields.get("artist").map(String::as_str), Some("Over"));
}

#[test]
fn convert_async_calls_exactly_one_callback_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    write_wav(&input, 44_100, 2, 1.0);

    let engine = fast_engine();
    let good = engine.initialize(&input, dir.path().join("good.mp3"));

    let successes = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    for handle in [good, INVALID_HANDLE] {
        let (s, f) = (Arc::clone(&successes), Arc::clone(&failures));
        let (tx_ok, tx_err) = (done_tx.clone(), done_tx.clone());
        engine.convert_async(
            handle,
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                let _ = tx_ok.send(());
            },
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
                let _ = tx_err.send(());
            },
        );
    }

    for _ in 0..2 {
        done_rx.recv_timeout(Duration::from_secs(60)).unwrap();
    }
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(engine.get_percentage(good), 100);
}

#[test]
fn convert_async_reports_every_job_when_engine_drops() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    write_wav(&input, 44_100, 2, 3.0);

    let mut config = EngineConfig {
        worker_threads: 1,
        max_blocking_threads: 1,
        ..Default::default()
    };
    config.conversion.quality = mp3fy::EncodingQuality::Fast;
    let engine = Engine::new(config).unwrap();

    const JOBS: usize = 6;
    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..JOBS {
        let handle = engine.initialize(&input, dir.path().join(format!("out{}.mp3", i)));
        assert_ne!(handle, INVALID_HANDLE);
        let (tx_ok, tx_err) = (done_tx.clone(), done_tx.clone());
        engine.convert_async(
            handle,
            move || {
                let _ = tx_ok.send((i, true));
            },
            move |_| {
                let _ = tx_err.send((i, false));
            },
        );
    }
    drop(done_tx);
    drop(engine);

    let mut calls = vec![0usize; JOBS];
    for _ in 0..JOBS {
        let (i, _) = done_rx.recv_timeout(Duration::from_secs(60)).unwrap();
        calls[i] += 1;
    }
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(calls, vec![1; JOBS]);
}

#[test]
fn metadata_async_delivers_fields() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fast_engine();
    let a = make_mp3(&engine, dir.path(), "a.mp3", 1.0);
    assert!(engine.edit_metadata_information(&a, [("genre", "Async")], None, &a));

    let (tx, rx) = mpsc::channel();
    engine.get_all_metadata_async(a, move |fields| {
        let _ = tx.send(fields);
    });
    let fields = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(fields.get("genre").map(String::as_str), Some("Async"));
}

#[test]
fn running_conversion_can_be_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("long.wav");
    let output = dir.path().join("long.mp3");
    write_wav(&input, 44_100, 2, 30.0);

    let engine = Arc::new(fast_engine());
    let handle = engine.initialize(&input, &output);
    assert_ne!(handle, INVALID_HANDLE);

    let cancelled = Arc::new(AtomicUsize::new(0));
    let on_progress = {
        let (engine, cancelled) = (Arc::clone(&engine), Arc::clone(&cancelled));
        Arc::new(move |pct: i32| {
            if pct > 0 && cancelled.load(Ordering::SeqCst) == 0 {
                assert_eq!(engine.session_status(handle).unwrap().state, SessionState::Running);
                assert!(engine.cancel(handle));
                cancelled.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let result = engine.try_convert_with_progress(handle, on_progress);
    assert!(matches!(result, Err(Mp3fyError::Cancelled)), "{:?}", result);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    let status = engine.session_status(handle).unwrap();
    assert_eq!(status.state, SessionState::Cancelled);
    assert!(status.progress > 0 && status.progress < 100, "{}", status.progress);
    assert!(output.exists());
    assert!(!engine.cancel(handle));
    assert!(!engine.convert(handle));
}

#[tokio::test]
async fn submitted_conversion_can_be_awaited() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.mp3");
    write_wav(&input, 22_050, 1, 1.0);

    let engine = fast_engine();
    let handle = engine.try_initialize(&input, &output).unwrap().to_raw();
    engine.submit(handle).join().await.unwrap();

    let status = engine.session_status(handle).unwrap();
    assert_eq!(status.state, SessionState::Succeeded);
    assert_eq!(status.progress, 100);
    assert!(status.elapsed_ms().is_some());
    assert!(status.error_detail.is_none());
}
