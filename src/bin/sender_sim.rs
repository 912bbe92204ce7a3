use pacs_edge::dicom::{self, uids};
use pacs_edge::dimse;
use std::process;
use std::thread;
use std::time::Duration;

struct SenderArgs {
    host: String,
    port: u16,
    calling_aet: String,
    called_aet: String,
    study_uid: String,
    modality: String,
    count: u32,
    burst: u32,
    delay_ms: u64,
}

impl SenderArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<SenderArgs, String> {
        let mut parsed = SenderArgs {
            host: "127.0.0.1".to_string(),
            port: 11112,
            calling_aet: "SENDER".to_string(),
            called_aet: "MINI_EDGE".to_string(),
            study_uid: dicom::generate_uid(),
            modality: "CT".to_string(),
            count: 1,
            burst: 1,
            delay_ms: 0,
        };
        while let Some(flag) = args.next() {
            let mut value = |name: &str| {
                args.next().ok_or_else(|| format!("{name} requires a value"))
            };
            match flag.as_str() {
                "--host" => parsed.host = value("--host")?,
                "--port" => {
                    parsed.port = value("--port")?
                        .parse()
                        .map_err(|e| format!("invalid --port: {e}"))?;
                }
                "--calling-aet" => parsed.calling_aet = value("--calling-aet")?,
                "--called-aet" => parsed.called_aet = value("--called-aet")?,
                "--study" => parsed.study_uid = value("--study")?,
                "--modality" => parsed.modality = value("--modality")?,
                "--count" => {
                    parsed.count = value("--count")?
                        .parse()
                        .map_err(|e| format!("invalid --count: {e}"))?;
                }
                "--burst" => {
                    parsed.burst = value("--burst")?
                        .parse()
                        .map_err(|e| format!("invalid --burst: {e}"))?;
                }
                "--delay-ms" => {
                    parsed.delay_ms = value("--delay-ms")?
                        .parse()
                        .map_err(|e| format!("invalid --delay-ms: {e}"))?;
                }
                other => return Err(format!("unknown argument `{other}`")),
            }
        }
        if !dicom::is_valid_uid(&parsed.study_uid) {
            return Err(format!("invalid study uid `{}`", parsed.study_uid));
        }
        Ok(parsed)
    }
}

fn sop_class_for(modality: &str) -> &'static str {
    match modality {
        "MR" => uids::MR_IMAGE_STORAGE,
        _ => uids::CT_IMAGE_STORAGE,
    }
}

fn run(args: SenderArgs) -> Result<(), String> {
    let contexts = vec![
        uids::CT_IMAGE_STORAGE.to_string(),
        uids::MR_IMAGE_STORAGE.to_string(),
    ];
    let mut association = dimse::associate(
        &args.host,
        args.port,
        &args.calling_aet,
        &args.called_aet,
        &contexts,
        Duration::from_secs(10),
    )
    .map_err(|e| format!("Association failed: {e}"))?;

    let series_uid = dicom::generate_uid();
    let sop_class = sop_class_for(&args.modality);
    for round in 1..=args.burst {
        for _ in 0..args.count {
            let sop_uid = dicom::generate_uid();
            let object = dicom::synthetic_image(
                sop_class,
                &args.study_uid,
                &series_uid,
                &sop_uid,
                &args.modality,
            );
            let bytes = dicom::write_file(&object);
            let status = association
                .c_store(sop_class, &sop_uid, &bytes)
                .map_err(|e| format!("c-store failed: {e}"))?;
            println!(
                "study={} sop={sop_uid} burst={round} status={}",
                args.study_uid,
                status.map(|code| format!("0x{code:04X}")).unwrap_or_else(|| "none".to_string())
            );
            if args.delay_ms > 0 {
                thread::sleep(Duration::from_millis(args.delay_ms));
            }
        }
    }
    association.release().map_err(|e| format!("release failed: {e}"))
}

fn main() {
    let args = match SenderArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    };
    if let Err(err) = run(args) {
        eprintln!("{err}");
        process::exit(1);
    }
}
