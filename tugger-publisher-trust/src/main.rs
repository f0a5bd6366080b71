// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    log::LevelFilter,
    std::{path::Path, str::FromStr, time::Duration},
    tugger_publisher_trust::{
        export_public_certificate, read_private_archive, AuthenticodeSigner, DirectoryTrustStore,
        ExecutableSigner, GenerationSettings, InstallSettings, PublicCertificate,
        PublicCertificateFormat, PublisherTrustError, SecretSource, SignatureStatus,
        SigningPlatform, SigningSettings, SigntoolSigner, StoreScope, Thumbprint,
        VerificationStatus, DEFAULT_TIMESTAMP_URL, PASSWORD_ENV,
    },
    zeroize::Zeroizing,
};

const PASSWORD_ABOUT: &str = "\
The private archive password is read from --password, from the file given
by --password-file or from the PUBLISHER_TRUST_PASSWORD environment variable,
in that order. Prefer the latter two: command line arguments are visible to
other processes on the machine.
";

const VERIFY_ABOUT: &str = "\
Verify the Authenticode signature of an executable.

Exits 0 only if the status is Valid. UntrustedRoot means the signer's
certificate is not in the local trust store: it describes this machine, not
the file. Pass the distributed certificate with --certificate to check a
file without installing anything.
";

const INSTALL_ABOUT: &str = "\
Install a public certificate as a trusted publisher.

Installing machine-wide requires elevated privileges. Without them, the
certificate is installed for the current user instead unless --no-degrade
is given. Expired certificates are installed with a warning; with --strict
they are refused unless --force is also given.
";

fn add_password_args(command: Command<'_>) -> Command<'_> {
    command
        .arg(
            Arg::new("password")
                .long("password")
                .takes_value(true)
                .help("Password of the private archive"),
        )
        .arg(
            Arg::new("password_file")
                .long("password-file")
                .takes_value(true)
                .conflicts_with("password")
                .help("File whose first line is the password of the private archive"),
        )
}

fn add_store_args(command: Command<'_>) -> Command<'_> {
    command.arg(
        Arg::new("store_dir")
            .long("store-dir")
            .takes_value(true)
            .help("Keep trusted certificates under this directory instead of the system store"),
    )
}

fn add_scope_arg<'a>(command: Command<'a>, default: &'a str) -> Command<'a> {
    command.arg(
        Arg::new("scope")
            .long("scope")
            .takes_value(true)
            .possible_values(&["machine", "user"])
            .default_value(default)
            .help("Trust store scope"),
    )
}

fn password(args: &ArgMatches) -> Result<Zeroizing<String>, PublisherTrustError> {
    let source = if let Some(password) = args.value_of("password") {
        SecretSource::value(password)
    } else if let Some(path) = args.value_of("password_file") {
        SecretSource::file(path)
    } else {
        SecretSource::Environment(PASSWORD_ENV.to_string())
    };

    source.resolve()
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str, PublisherTrustError> {
    args.value_of(name)
        .ok_or_else(|| PublisherTrustError::BadArgument(format!("--{} is required", name)))
}

fn platform(args: &ArgMatches) -> Result<SigningPlatform, PublisherTrustError> {
    match args.value_of("store_dir") {
        Some(dir) => {
            let dir = Path::new(dir);
            Ok(SigningPlatform::new(
                Box::new(AuthenticodeSigner::new()),
                Box::new(DirectoryTrustStore::with_roots(
                    dir.join("machine"),
                    dir.join("user"),
                )),
            ))
        }
        None => SigningPlatform::detect(),
    }
}

fn certificate_format(
    args: &ArgMatches,
    path: &Path,
) -> Result<PublicCertificateFormat, PublisherTrustError> {
    match args.value_of("format") {
        Some(format) => PublicCertificateFormat::from_str(format),
        None => Ok(PublicCertificateFormat::from_path(path)),
    }
}

fn command_generate(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let mut settings =
        GenerationSettings::new(required(args, "subject")?, required(args, "publisher")?);
    if let Some(days) = args.value_of("days") {
        settings.set_validity_days(u32::from_str(days).map_err(|_| {
            PublisherTrustError::BadArgument(format!("invalid number of days: {}", days))
        })?);
    }

    let archive = Path::new(required(args, "pfx")?);
    let password = password(args)?;

    let identity = tugger_publisher_trust::generate_identity(&settings)?;
    tugger_publisher_trust::export_private_archive(&identity, &password, archive)?;

    if let Some(path) = args.value_of("certificate") {
        let path = Path::new(path);
        export_public_certificate(
            identity.certificate(),
            path,
            certificate_format(args, path)?,
        )?;
    }

    println!("{}", identity.certificate());

    Ok(())
}

fn command_export_public(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let password = password(args)?;
    let identity = read_private_archive(required(args, "pfx")?, &password)?;

    let path = Path::new(required(args, "output")?);
    export_public_certificate(identity.certificate(), path, certificate_format(args, path)?)?;

    println!("{}", identity.certificate().thumbprint());

    Ok(())
}

fn command_sign(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let mut settings = SigningSettings::default();
    if let Some(url) = args.value_of("timestamp_url") {
        settings.set_timestamp_url(url);
    }
    if let Some(timeout) = args.value_of("timeout") {
        settings.set_timestamp_timeout(Duration::from_secs(u64::from_str(timeout).map_err(
            |_| PublisherTrustError::BadArgument(format!("invalid timeout: {}", timeout)),
        )?));
    }
    if args.is_present("no_retry") {
        settings.set_timestamp_attempts(1);
    }
    if let Some(description) = args.value_of("description") {
        settings.set_description(description);
    }

    let executable = Path::new(required(args, "path")?);
    let archive = Path::new(required(args, "pfx")?);
    let password = password(args)?;

    let signer: Box<dyn ExecutableSigner> = match args.value_of("signer") {
        Some("builtin") => Box::new(AuthenticodeSigner::new()),
        Some("signtool") => Box::new(SigntoolSigner::new()?),
        _ => SigningPlatform::detect_signer(),
    };

    let result = signer.sign(executable, archive, &password, &settings)?;

    println!("status: {}", result.status);
    if let Some(subject) = &result.signer_subject {
        println!("signer: {}", subject);
    }
    if let Some(signed_at) = &result.signed_at {
        println!("time-stamped: {}", signed_at.to_rfc3339());
    }

    match result.status {
        SignatureStatus::Valid => Ok(()),
        _ => Err(PublisherTrustError::VerificationMismatch(
            result
                .reason
                .unwrap_or_else(|| "signature did not verify".to_string()),
        )),
    }
}

fn command_verify(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let executable = Path::new(required(args, "path")?);
    let pinned = args
        .value_of("certificate")
        .map(PublicCertificate::from_path)
        .transpose()?;

    let result = platform(args)?.verify(executable, pinned.as_ref())?;

    println!("status: {}", result.status);
    if let Some(subject) = &result.signer_subject {
        println!("signer: {}", subject);
    }
    if let Some(issuer) = &result.signer_issuer {
        println!("issuer: {}", issuer);
    }
    if let Some(thumbprint) = &result.signer_thumbprint {
        println!("thumbprint: {}", thumbprint);
    }
    if let Some(description) = &result.description {
        println!("description: {}", description);
    }
    println!("time-stamp valid: {}", result.timestamp_valid);
    if let Some(signed_at) = &result.signed_at {
        println!("time-stamped: {}", signed_at.to_rfc3339());
    }
    if let Some(note) = result.note() {
        println!("note: {}", note);
    }

    match result.status {
        VerificationStatus::Valid => Ok(()),
        status => Err(PublisherTrustError::VerificationMismatch(format!(
            "{}: {}",
            status,
            result.detail.as_deref().unwrap_or("no signature")
        ))),
    }
}

fn command_install(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let path = Path::new(required(args, "path")?);
    let scope = StoreScope::from_str(required(args, "scope")?)?;

    let mut settings = InstallSettings::default();
    settings
        .set_allow_degrade(!args.is_present("no_degrade"))
        .set_strict_expiry(args.is_present("strict"))
        .set_allow_expired(args.is_present("force"));

    let outcome = platform(args)?.install(path, scope, settings)?;

    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    println!("thumbprint: {}", outcome.thumbprint());
    println!("scope: {}", outcome.scope());
    if outcome.degraded {
        println!("degraded: requested {} scope", outcome.requested_scope);
    }

    Ok(())
}

fn command_verify_installed(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let thumbprint = Thumbprint::from_str(required(args, "thumbprint")?)?;
    let scope = StoreScope::from_str(required(args, "scope")?)?;

    if platform(args)?.verify_installed(&thumbprint, scope)? {
        println!("{} is installed in the {} store", thumbprint, scope);
        Ok(())
    } else {
        Err(PublisherTrustError::VerificationMismatch(format!(
            "{} is not installed in the {} store",
            thumbprint, scope
        )))
    }
}

fn command_show_certificate(args: &ArgMatches) -> Result<(), PublisherTrustError> {
    let cert = PublicCertificate::from_path(required(args, "path")?)?;

    println!("{}", cert);
    if !cert.is_code_signing() {
        println!("note: extended key usage does not allow code signing");
    }
    if !cert.is_self_signed() {
        println!("note: not self-signed; its issuer must be trusted for signatures to verify");
    }

    Ok(())
}

fn app<'a>() -> Command<'a> {
    let app = Command::new("Self-signed publisher trust for Windows executables")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Generate a code signing identity, sign executables and install trust")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(add_password_args(
        Command::new("generate")
            .about("Generate a key pair and self-signed code signing certificate")
            .after_help(PASSWORD_ABOUT)
            .arg(
                Arg::new("subject")
                    .long("subject")
                    .takes_value(true)
                    .required(true)
                    .help("Product name; the certificate's common name"),
            )
            .arg(
                Arg::new("publisher")
                    .long("publisher")
                    .takes_value(true)
                    .required(true)
                    .help("Publisher name; the certificate's organization"),
            )
            .arg(
                Arg::new("days")
                    .long("days")
                    .takes_value(true)
                    .help("Validity in days (default 1825)"),
            )
            .arg(
                Arg::new("pfx")
                    .long("pfx")
                    .takes_value(true)
                    .required(true)
                    .help("Where to write the password protected private archive"),
            )
            .arg(
                Arg::new("certificate")
                    .long("certificate")
                    .takes_value(true)
                    .help("Where to write the public certificate"),
            )
            .arg(
                Arg::new("format")
                    .long("format")
                    .takes_value(true)
                    .possible_values(&["pem", "der"])
                    .help("Encoding of the public certificate (default from extension)"),
            ),
    ));

    let app = app.subcommand(add_password_args(
        Command::new("export-public")
            .about("Write the public certificate held by a private archive")
            .after_help(PASSWORD_ABOUT)
            .arg(
                Arg::new("pfx")
                    .long("pfx")
                    .takes_value(true)
                    .required(true)
                    .help("Private archive to read"),
            )
            .arg(
                Arg::new("output")
                    .long("output")
                    .short('o')
                    .takes_value(true)
                    .required(true)
                    .help("Where to write the certificate"),
            )
            .arg(
                Arg::new("format")
                    .long("format")
                    .takes_value(true)
                    .possible_values(&["pem", "der"])
                    .help("Encoding of the certificate (default from extension)"),
            ),
    ));

    let app = app.subcommand(add_password_args(
        Command::new("sign")
            .about("Sign a PE executable in place")
            .after_help(PASSWORD_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Executable to sign"),
            )
            .arg(
                Arg::new("pfx")
                    .long("pfx")
                    .takes_value(true)
                    .required(true)
                    .help("Private archive holding the signing identity"),
            )
            .arg(
                Arg::new("timestamp_url")
                    .long("timestamp-url")
                    .takes_value(true)
                    .help("RFC 3161 time-stamp authority")
                    .default_value(DEFAULT_TIMESTAMP_URL),
            )
            .arg(
                Arg::new("timeout")
                    .long("timeout")
                    .takes_value(true)
                    .help("Time-stamp request timeout in seconds (default 30)"),
            )
            .arg(
                Arg::new("no_retry")
                    .long("no-retry")
                    .help("Do not retry a failed time-stamp request"),
            )
            .arg(
                Arg::new("description")
                    .long("description")
                    .takes_value(true)
                    .help("Program description to embed in the signature"),
            )
            .arg(
                Arg::new("signer")
                    .long("signer")
                    .takes_value(true)
                    .possible_values(&["auto", "builtin", "signtool"])
                    .default_value("auto")
                    .help("Signing back-end"),
            ),
    ));

    let app = app.subcommand(add_store_args(
        Command::new("verify")
            .about("Verify the signature of an executable")
            .long_about(VERIFY_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Executable to verify"),
            )
            .arg(
                Arg::new("certificate")
                    .long("certificate")
                    .takes_value(true)
                    .help("Also trust this public certificate"),
            ),
    ));

    let app = app.subcommand(add_store_args(add_scope_arg(
        Command::new("install")
            .about("Install a public certificate as a trusted publisher")
            .long_about(INSTALL_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("PEM or DER certificate to install"),
            )
            .arg(
                Arg::new("no_degrade")
                    .long("no-degrade")
                    .help("Fail instead of installing for the current user only"),
            )
            .arg(
                Arg::new("strict")
                    .long("strict")
                    .help("Refuse expired certificates"),
            )
            .arg(
                Arg::new("force")
                    .long("force")
                    .help("Install expired certificates even with --strict"),
            ),
        "machine",
    )));

    let app = app.subcommand(add_store_args(add_scope_arg(
        Command::new("verify-installed")
            .about("Check whether a certificate is installed")
            .arg(
                Arg::new("thumbprint")
                    .required(true)
                    .help("SHA-1 thumbprint of the certificate"),
            ),
        "user",
    )));

    let app = app.subcommand(
        Command::new("show-certificate")
            .about("Print the properties of a public certificate")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("PEM or DER certificate"),
            ),
    );

    app
}

fn init_logging(matches: &ArgMatches) {
    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    if log_level == LevelFilter::Info {
        builder
            .filter_module("rustls", LevelFilter::Error)
            .filter_module("reqwest", LevelFilter::Error);
    }

    builder.init();
}

fn run(matches: &ArgMatches) -> Result<(), PublisherTrustError> {
    match matches.subcommand() {
        Some(("generate", args)) => command_generate(args),
        Some(("export-public", args)) => command_export_public(args),
        Some(("sign", args)) => command_sign(args),
        Some(("verify", args)) => command_verify(args),
        Some(("install", args)) => command_install(args),
        Some(("verify-installed", args)) => command_verify_installed(args),
        Some(("show-certificate", args)) => command_show_certificate(args),
        _ => Err(PublisherTrustError::BadArgument("unknown command".into())),
    }
}

fn main_impl() -> Result<(), PublisherTrustError> {
    let matches = app().get_matches();
    init_logging(&matches);

    run(&matches)
}

/// Lines written to standard error when a command fails.
fn error_report(err: &PublisherTrustError) -> Vec<String> {
    let mut lines = vec![format!("error: {}: {}", err.kind(), err)];
    if let Some(hint) = err.remediation() {
        lines.push(format!("hint: {}", hint));
    }

    lines
}

fn exit_code(result: &Result<(), PublisherTrustError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn main() {
    let result = main_impl();

    if let Err(err) = &result {
        for line in error_report(err) {
            eprintln!("{}", line);
        }
    }

    std::process::exit(exit_code(&result))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        authenticode_signature::testutil::{synthetic_pe_image, FakeTimeStampClient},
        chrono::Utc,
        clap::ErrorKind,
        std::rc::Rc,
    };

    const PASSWORD: &str = "correct horse";

    fn matches(args: &[&str]) -> Result<ArgMatches, clap::Error> {
        app().try_get_matches_from(std::iter::once("publisher-trust").chain(args.iter().copied()))
    }

    fn run_args(args: &[&str]) -> Result<(), PublisherTrustError> {
        let matches =
            matches(args).map_err(|e| PublisherTrustError::BadArgument(e.to_string()))?;

        run(&matches)
    }

    fn arg(path: &Path) -> String {
        path.display().to_string()
    }

    fn is_mismatch(result: &Result<(), PublisherTrustError>, status: VerificationStatus) -> bool {
        matches!(
            result,
            Err(PublisherTrustError::VerificationMismatch(detail))
                if detail.starts_with(&format!("{}:", status))
        )
    }

    #[test]
    fn command_line_defaults() -> anyhow::Result<()> {
        let m = matches(&["sign", "app.exe", "--pfx", "identity.pfx"])?;
        let args = m
            .subcommand_matches("sign")
            .ok_or_else(|| anyhow::anyhow!("sign not matched"))?;
        assert_eq!(args.value_of("path"), Some("app.exe"));
        assert_eq!(args.value_of("timestamp_url"), Some(DEFAULT_TIMESTAMP_URL));
        assert_eq!(args.value_of("signer"), Some("auto"));
        assert!(!args.is_present("no_retry"));

        let m = matches(&["install", "publisher.pem"])?;
        assert_eq!(
            m.subcommand_matches("install")
                .and_then(|args| args.value_of("scope")),
            Some("machine")
        );

        let m = matches(&["verify-installed", "00", "--store-dir", "store"])?;
        let args = m
            .subcommand_matches("verify-installed")
            .ok_or_else(|| anyhow::anyhow!("verify-installed not matched"))?;
        assert_eq!(args.value_of("scope"), Some("user"));
        assert_eq!(args.value_of("store_dir"), Some("store"));

        let m = matches(&["-v", "-v", "show-certificate", "publisher.der"])?;
        assert_eq!(m.occurrences_of("verbose"), 2);

        Ok(())
    }

    #[test]
    fn command_line_errors() {
        let kind = |args: &[&str]| matches(args).err().map(|e| e.kind());

        assert_eq!(
            kind(&["generate", "--subject", "App"]),
            Some(ErrorKind::MissingRequiredArgument)
        );
        assert_eq!(
            kind(&["install", "publisher.pem", "--scope", "global"]),
            Some(ErrorKind::InvalidValue)
        );
        assert_eq!(
            kind(&[
                "sign",
                "app.exe",
                "--pfx",
                "identity.pfx",
                "--password",
                "x",
                "--password-file",
                "password.txt",
            ]),
            Some(ErrorKind::ArgumentConflict)
        );
    }

    #[test]
    fn failures_exit_non_zero_with_hint() {
        assert_eq!(exit_code(&Ok(())), 0);

        let result = Err(PublisherTrustError::VerificationMismatch(
            "HashMismatch: file content does not match the signed digest".into(),
        ));
        assert_eq!(exit_code(&result), 1);

        let report = result.err().map(|e| error_report(&e)).unwrap_or_default();
        assert_eq!(report.len(), 2);
        assert!(report[0].starts_with("error: VerificationMismatch: "));
        assert!(report[0].contains("HashMismatch"));
        assert!(report[1].starts_with("hint: "));

        let report = error_report(&PublisherTrustError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk on fire",
        )));
        assert_eq!(report, vec!["error: IoError: I/O error: disk on fire".to_string()]);
    }

    #[test]
    fn generate_sign_verify_tamper() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let pfx = arg(&temp_dir.path().join("identity.pfx"));
        let cert = arg(&temp_dir.path().join("identity.pem"));
        let store = arg(&temp_dir.path().join("store"));
        let exe_path = temp_dir.path().join("app.exe");
        let exe = arg(&exe_path);
        std::fs::write(&exe_path, synthetic_pe_image(8192))?;

        run_args(&[
            "generate",
            "--subject",
            "Test App",
            "--publisher",
            "Test Org",
            "--days",
            "30",
            "--pfx",
            &pfx,
            "--certificate",
            &cert,
            "--password",
            PASSWORD,
        ])?;
        run_args(&["show-certificate", &cert])?;

        let verify = |pinned: bool| {
            if pinned {
                run_args(&["verify", &exe, "--certificate", &cert, "--store-dir", &store])
            } else {
                run_args(&["verify", &exe, "--store-dir", &store])
            }
        };

        let result = verify(true);
        assert_eq!(exit_code(&result), 1);
        assert!(is_mismatch(&result, VerificationStatus::NotSigned), "{:?}", result);

        // No time-stamp authority listens on the discard port.
        let unsigned = std::fs::read(&exe_path)?;
        let result = run_args(&[
            "sign",
            &exe,
            "--pfx",
            &pfx,
            "--password",
            PASSWORD,
            "--signer",
            "builtin",
            "--timestamp-url",
            "http://127.0.0.1:9/",
            "--timeout",
            "5",
            "--no-retry",
        ]);
        assert_eq!(exit_code(&result), 1);
        match &result {
            Err(err) => {
                assert!(
                    matches!(
                        err,
                        PublisherTrustError::TimestampUnavailable { attempts: 1, .. }
                    ),
                    "{:?}",
                    err
                );
                assert!(error_report(err)[1].contains("--timestamp-url"));
            }
            Ok(()) => panic!("signing succeeded without a time-stamp authority"),
        }
        assert_eq!(std::fs::read(&exe_path)?, unsigned);

        let mut settings = SigningSettings::default();
        settings.set_description("Test App");
        let signed = AuthenticodeSigner::with_time_stamp_client(Rc::new(FakeTimeStampClient::new(
            Utc::now(),
        )))
        .sign(&exe_path, Path::new(&pfx), PASSWORD, &settings)?;
        assert_eq!(signed.status, SignatureStatus::Valid);

        assert_eq!(exit_code(&verify(true)), 0);
        let result = verify(false);
        assert!(is_mismatch(&result, VerificationStatus::UntrustedRoot), "{:?}", result);

        run_args(&["install", &cert, "--scope", "user", "--store-dir", &store])?;
        let thumbprint = PublicCertificate::from_path(&cert)?.thumbprint().to_string();
        run_args(&["verify-installed", &thumbprint, "--store-dir", &store])?;
        assert!(matches!(
            run_args(&[
                "verify-installed",
                &thumbprint,
                "--scope",
                "machine",
                "--store-dir",
                &store
            ]),
            Err(PublisherTrustError::VerificationMismatch(_))
        ));
        assert_eq!(exit_code(&verify(false)), 0);

        let signed_data = std::fs::read(&exe_path)?;
        for offset in [0x80, 0x400 + 100] {
            let mut tampered = signed_data.clone();
            tampered[offset] ^= 0x01;
            std::fs::write(&exe_path, &tampered)?;

            let result = verify(true);
            assert_eq!(exit_code(&result), 1);
            assert!(
                is_mismatch(&result, VerificationStatus::HashMismatch),
                "offset {:#x}: {:?}",
                offset,
                result
            );
        }

        Ok(())
    }
}
