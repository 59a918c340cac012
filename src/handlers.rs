use crate::auth::{self, Auth};
use crate::config::Config;
use crate::database::JsonStore;
use crate::error::Error;
use crate::gallery::{Gallery, NewEntry};
use crate::model::QrEntry;
use crate::qr::QrOptions;
use actix_files::{Files, NamedFile};
use actix_identity::{config::LogoutBehaviour, Identity, IdentityMiddleware};
use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use actix_session::{storage::CookieSessionStore, Session, SessionMiddleware};
use actix_web::{
    cookie::Key, error, http::header, middleware::DefaultHeaders, web, Either, HttpMessage,
    HttpRequest, HttpResponse,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

pub const SESSION_COOKIE: &str = "session";
const FLASH_KEY: &str = "_flashes";
const LAST_QR_KEY: &str = "last_qr";
// matches the default total limit of `MultipartForm`
const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

type Tera = web::Data<tera::Tera>;
type Db = web::Data<JsonStore>;
type Settings = web::Data<Config>;

/// Everything the handlers share, built once and cloned into each worker.
#[derive(Clone)]
pub struct State {
    config: Settings,
    tera: Tera,
    db: Db,
    gallery: web::Data<Gallery>,
    auth: web::Data<Auth>,
}

impl State {
    pub fn new(config: Config, tera: tera::Tera) -> Self {
        let db = JsonStore::new(&config.users_file);
        let gallery = Gallery::new(config.qr_dir(), QrOptions::default());
        info!("Users in {:?}, QR codes in {:?}", db.path(), gallery.qr_dir());
        State {
            tera: web::Data::new(tera),
            db: web::Data::new(db),
            gallery: web::Data::new(gallery),
            auth: web::Data::new(Auth::new(config.bcrypt_cost)),
            config: web::Data::new(config),
        }
    }

    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(self.config.clone())
            .app_data(self.tera.clone())
            .app_data(self.db.clone())
            .app_data(self.gallery.clone())
            .app_data(self.auth.clone())
            .app_data(web::PayloadConfig::new(MAX_BODY_SIZE))
            .route("/", web::get().to(index))
            .route("/", web::post().to(index_post))
            .route("/login", web::get().to(login))
            .route("/login", web::post().to(login_post))
            .route("/register", web::get().to(register))
            .route("/register", web::post().to(register_post))
            .route("/logout", web::get().to(logout))
            .route("/delete_qr/{key}", web::post().to(delete_qr))
            .route("/robots.txt", web::get().to(robots))
            .service(Files::new("/static", &self.config.static_dir));
    }
}

pub fn session_middleware(key: Key, secure: bool) -> SessionMiddleware<CookieSessionStore> {
    SessionMiddleware::builder(CookieSessionStore::default(), key)
        .cookie_name(SESSION_COOKIE.to_owned())
        .cookie_secure(secure)
        .build()
}

pub fn identity_middleware() -> IdentityMiddleware {
    // keep the rest of the session so the logout notice survives
    IdentityMiddleware::builder()
        .logout_behaviour(LogoutBehaviour::DeleteIdentityKeys)
        .build()
}

/// Allows the configured origins to embed every page in a frame.
pub fn frame_headers(config: &Config) -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::X_FRAME_OPTIONS, "ALLOWALL"))
        .add((header::CONTENT_SECURITY_POLICY, config.content_security_policy()))
}

fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> error::Error {
    error!("{:?}", err);
    error::ErrorInternalServerError(message)
}

fn redirect(location: &str) -> HttpResponse {
    HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .finish()
}

fn flash(session: &Session, message: impl Into<String>) {
    let mut messages: Vec<String> = session.get(FLASH_KEY).ok().flatten().unwrap_or_default();
    messages.push(message.into());
    if let Err(err) = session.insert(FLASH_KEY, messages) {
        warn!("Could not store flash message: {}", err);
    }
}

fn take_flashes(session: &Session) -> Vec<String> {
    session
        .remove_as(FLASH_KEY)
        .and_then(Result::ok)
        .unwrap_or_default()
}

/// Turns a user-correctable error into a notice on the page at `location`.
fn notice_or_fail(session: &Session, err: Error, location: &str) -> actix_web::Result<HttpResponse> {
    if err.is_user_facing() {
        flash(session, err.to_string());
        Ok(redirect(location))
    } else {
        Err(err.into())
    }
}

fn current_user(id: Option<Identity>) -> Option<String> {
    id.and_then(|id| id.id().ok())
}

fn base_url(req: &HttpRequest, config: &Config) -> String {
    match config.public_url {
        Some(ref url) => url.clone(),
        None => {
            let info = req.connection_info();
            format!("{}://{}/", info.scheme(), info.host())
        }
    }
}

fn context(username: Option<&str>, session: &Session) -> tera::Context {
    let mut ctx = tera::Context::new();
    ctx.insert("username", &username);
    ctx.insert("messages", &take_flashes(session));
    ctx
}

fn render(tera: &tera::Tera, template: &str, ctx: &tera::Context) -> actix_web::Result<HttpResponse> {
    let body = tera
        .render(template, ctx)
        .map_err(|err| log_error(err, "Template error"))?;
    Ok(HttpResponse::Ok().content_type("text/html").body(body))
}

#[derive(Serialize)]
struct EntryView<'a> {
    name: &'a str,
    file: &'a str,
    key: &'a str,
}

impl<'a> From<&'a QrEntry> for EntryView<'a> {
    fn from(entry: &'a QrEntry) -> Self {
        EntryView {
            name: &entry.name,
            file: &entry.file,
            key: entry.key(),
        }
    }
}

async fn index(
    id: Option<Identity>,
    session: Session,
    tera: Tera,
    db: Db,
    gallery: web::Data<Gallery>,
) -> actix_web::Result<HttpResponse> {
    let username = current_user(id);
    let entries = gallery.list_entries(db.get_ref(), username.as_deref());
    let mut ctx = context(username.as_deref(), &session);
    ctx.insert(
        "user_qr_list",
        &entries.iter().map(EntryView::from).collect::<Vec<_>>(),
    );
    let qr_img: Option<String> = session.remove_as(LAST_QR_KEY).and_then(Result::ok);
    ctx.insert("qr_img", &qr_img);
    render(&tera, "index.html", &ctx)
}

#[derive(MultipartForm)]
struct QrForm {
    #[multipart(rename = "text-url")]
    text: Option<Text<String>>,
    #[multipart(rename = "fichier")]
    file: Option<TempFile>,
    #[multipart(rename = "qr-name")]
    name: Option<Text<String>>,
}

/// Text-only variant of [`QrForm`] for url-encoded posts.
#[derive(Serialize, Deserialize)]
struct QrFields {
    #[serde(default, rename = "text-url")]
    text: Option<String>,
    #[serde(default, rename = "qr-name")]
    name: Option<String>,
}

async fn index_post(
    req: HttpRequest,
    id: Option<Identity>,
    session: Session,
    form: Either<MultipartForm<QrForm>, web::Form<QrFields>>,
    config: Settings,
    db: Db,
    gallery: web::Data<Gallery>,
) -> actix_web::Result<HttpResponse> {
    let username = match current_user(id) {
        Some(username) => username,
        None => {
            flash(&session, "You need to log in to save QR codes!");
            return Ok(redirect("/login"));
        }
    };

    // the temp file is deleted on drop, so it has to outlive add_entry
    let (fields, file) = match form {
        Either::Left(MultipartForm(form)) => (
            QrFields {
                text: form.text.map(|text| text.0),
                name: form.name.map(|name| name.0),
            },
            form.file,
        ),
        Either::Right(web::Form(fields)) => (fields, None),
    };
    let upload = file.as_ref().and_then(|file| {
        let file_name = file.file_name.clone()?;
        Some((file_name, file.file.path().to_path_buf()))
    });
    let new_entry = NewEntry::new(fields.name, fields.text, upload);
    let base_url = base_url(&req, &config);
    let added = new_entry
        .and_then(|new_entry| gallery.add_entry(db.get_ref(), &username, new_entry, &base_url));

    match added {
        Ok(entry) => {
            flash(&session, format!("QR '{}' saved successfully!", entry.name));
            if let Err(err) = session.insert(LAST_QR_KEY, &entry.file) {
                warn!("Could not remember last QR code: {}", err);
            }
            Ok(redirect("/"))
        }
        Err(err) => notice_or_fail(&session, err, "/"),
    }
}

async fn login(id: Option<Identity>, session: Session, tera: Tera) -> actix_web::Result<HttpResponse> {
    let username = current_user(id);
    render(&tera, "login.html", &context(username.as_deref(), &session))
}

#[derive(Serialize, Deserialize)]
struct LoginParams {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login_post(
    req: HttpRequest,
    params: web::Form<LoginParams>,
    session: Session,
    db: Db,
    auth: web::Data<Auth>,
) -> actix_web::Result<HttpResponse> {
    if let Err(err) = auth.login(db.get_ref(), &params.username, &params.password) {
        return notice_or_fail(&session, err, "/login");
    }
    Identity::login(&req.extensions(), params.username.clone())
        .map_err(|err| log_error(err, "Session error"))?;
    flash(&session, format!("Welcome, {}!", params.username));
    Ok(redirect("/"))
}

async fn register(id: Option<Identity>, session: Session, tera: Tera) -> actix_web::Result<HttpResponse> {
    let username = current_user(id);
    render(&tera, "register.html", &context(username.as_deref(), &session))
}

#[derive(Serialize, Deserialize)]
struct RegisterParams {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    password2: String,
}

async fn register_post(
    params: web::Form<RegisterParams>,
    session: Session,
    db: Db,
    auth: web::Data<Auth>,
) -> actix_web::Result<HttpResponse> {
    match auth.register(
        db.get_ref(),
        &params.username,
        &params.password,
        &params.password2,
    ) {
        Ok(()) => {
            flash(&session, "Registration successful! You can now login.");
            Ok(redirect("/login"))
        }
        Err(err) => notice_or_fail(&session, err, "/register"),
    }
}

async fn logout(id: Option<Identity>, session: Session) -> actix_web::Result<HttpResponse> {
    auth::logout(id);
    flash(&session, "Logged out successfully.");
    Ok(redirect("/"))
}

async fn delete_qr(
    key: web::Path<String>,
    id: Option<Identity>,
    session: Session,
    db: Db,
    gallery: web::Data<Gallery>,
) -> actix_web::Result<HttpResponse> {
    let username = match current_user(id) {
        Some(username) => username,
        None => {
            flash(&session, "You must be logged in to delete QR codes!");
            return Ok(redirect("/login"));
        }
    };
    match gallery.remove_entry(db.get_ref(), &username, &key) {
        Ok(_) => {
            flash(&session, "QR code deleted successfully!");
            Ok(redirect("/"))
        }
        Err(err) => notice_or_fail(&session, err, "/"),
    }
}

async fn robots(config: Settings) -> actix_web::Result<NamedFile> {
    Ok(NamedFile::open(config.static_dir.join("robots.txt"))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::UserDb;
    use actix_web::{
        body::{to_bytes, MessageBody},
        cookie::Cookie,
        dev::ServiceResponse,
        http::StatusCode,
        test::{self, TestRequest},
        App,
    };
    use std::fs;

    const BOUNDARY: &str = "----qrgallerytestboundary";

    fn test_state(dir: &std::path::Path) -> (Config, State) {
        let config = Config {
            users_file: dir.join("users.json"),
            static_dir: dir.join("static"),
            bcrypt_cost: 4,
            ..Config::default()
        };
        fs::create_dir_all(config.qr_dir()).unwrap();
        fs::write(config.static_dir.join("robots.txt"), "User-agent: *\nDisallow:\n").unwrap();
        let tera = tera::Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/**/*")).unwrap();
        (config.clone(), State::new(config, tera))
    }

    macro_rules! test_app {
        ($config:expr, $state:expr) => {{
            let state = $state.clone();
            test::init_service(
                App::new()
                    .wrap(identity_middleware())
                    .wrap(session_middleware(Key::generate(), false))
                    .wrap(frame_headers(&$config))
                    .configure(move |cfg| state.configure(cfg)),
            )
            .await
        }};
    }

    macro_rules! send {
        ($app:expr, $browser:expr, $req:expr) => {{
            let resp = test::call_service(&$app, $browser.prepare($req).to_request()).await;
            $browser.absorb(resp).await
        }};
    }

    /// Carries the session cookie from one request to the next.
    #[derive(Default)]
    struct Browser {
        cookie: Option<Cookie<'static>>,
    }

    struct Page {
        status: StatusCode,
        location: String,
        body: String,
    }

    impl Browser {
        fn prepare(&self, req: TestRequest) -> TestRequest {
            match self.cookie {
                Some(ref cookie) => req.cookie(cookie.clone()),
                None => req,
            }
        }

        async fn absorb<B: MessageBody>(&mut self, resp: ServiceResponse<B>) -> Page {
            if let Some(cookie) = resp
                .response()
                .cookies()
                .find(|cookie| cookie.name() == SESSION_COOKIE)
            {
                self.cookie = Some(cookie.into_owned());
            }
            let status = resp.status();
            let location = resp
                .headers()
                .get(header::LOCATION)
                .map(|value| value.to_str().unwrap().to_owned())
                .unwrap_or_default();
            let body = to_bytes(resp.into_body()).await.ok().unwrap();
            Page {
                status,
                location,
                body: String::from_utf8(body.to_vec()).unwrap(),
            }
        }
    }

    fn get(uri: &str) -> TestRequest {
        TestRequest::get().uri(uri)
    }

    fn form(uri: &str, fields: &[(&str, &str)]) -> TestRequest {
        TestRequest::post().uri(uri).set_form(fields)
    }

    fn multipart(fields: &[(&str, &str)], file: Option<(&str, &str)>) -> TestRequest {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            ));
        }
        if let Some((file_name, content)) = file {
            body.push_str(&format!(
                "--{}\r\nContent-Disposition: form-data; name=\"fichier\"; filename=\"{}\"\r\nContent-Type: text/plain\r\n\r\n{}\r\n",
                BOUNDARY, file_name, content
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        TestRequest::post()
            .uri("/")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
    }

    #[actix_rt::test]
    async fn frame_policy_on_every_response() {
        let dir = tempfile::tempdir().unwrap();
        let (config, state) = test_state(dir.path());
        let app = test_app!(config, state);

        for uri in &["/", "/login", "/robots.txt", "/does-not-exist"] {
            let resp = test::call_service(&app, get(uri).to_request()).await;
            assert_eq!(resp.headers().get(header::X_FRAME_OPTIONS).unwrap(), "ALLOWALL");
            assert_eq!(
                resp.headers().get(header::CONTENT_SECURITY_POLICY).unwrap(),
                "frame-ancestors 'self' https://whop.com"
            );
        }
    }

    #[actix_rt::test]
    async fn robots_txt() {
        let dir = tempfile::tempdir().unwrap();
        let (config, state) = test_state(dir.path());
        let app = test_app!(config, state);
        let mut browser = Browser::default();

        let page = send!(app, browser, get("/robots.txt"));
        assert_eq!(page.status, StatusCode::OK);
        assert!(page.body.starts_with("User-agent: *"));
    }

    #[actix_rt::test]
    async fn anonymous_cannot_save_or_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (config, state) = test_state(dir.path());
        let app = test_app!(config, state);
        let mut browser = Browser::default();

        let page = send!(app, browser, get("/"));
        assert_eq!(page.status, StatusCode::OK);
        assert!(page.body.contains("href=\"/login\""));

        let page = send!(app, browser, multipart(&[("text-url", "hello")], None));
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location, "/login");
        let page = send!(app, browser, get("/login"));
        assert!(page.body.contains("You need to log in to save QR codes!"));

        let page = send!(app, browser, form("/delete_qr/abc", &[]));
        assert_eq!(page.location, "/login");
        assert!(!config.users_file.exists());
    }

    #[actix_rt::test]
    async fn register_login_and_manage_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let (config, state) = test_state(dir.path());
        let app = test_app!(config, state);
        let mut browser = Browser::default();

        let creds = [("username", "alice"), ("password", "pw"), ("password2", "pw")];
        let page = send!(app, browser, form("/register", &creds));
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location, "/login");
        let page = send!(app, browser, get("/login"));
        assert!(page.body.contains("Registration successful! You can now login."));

        let page = send!(app, browser, form("/register", &creds));
        assert_eq!(page.location, "/register");
        let page = send!(app, browser, get("/register"));
        assert!(page.body.contains("Username already exists!"));

        let wrong = [("username", "alice"), ("password", "nope")];
        let page = send!(app, browser, form("/login", &wrong));
        assert_eq!(page.location, "/login");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("Invalid username or password!"));
        assert!(!page.body.contains("Logged in as"));

        let right = [("username", "alice"), ("password", "pw")];
        let page = send!(app, browser, form("/login", &right));
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("Welcome, alice!"));
        assert!(page.body.contains("Logged in as"));

        let before = fs::read_to_string(&config.users_file).unwrap();
        let page = send!(app, browser, multipart(&[("qr-name", "Nothing")], None));
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("Please enter text or upload a file."));
        assert_eq!(fs::read_to_string(&config.users_file).unwrap(), before);
        assert_eq!(fs::read_dir(config.qr_dir()).unwrap().count(), 0);

        let fields = [("text-url", "hello"), ("qr-name", "Greeting")];
        let page = send!(app, browser, multipart(&fields, None));
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("saved successfully!"));
        assert!(page.body.contains("Greeting"));

        let store = JsonStore::new(&config.users_file);
        let entries = store.get_user("alice").unwrap().qr_codes;
        assert_eq!(entries.len(), 1);
        let entry = entries[0].clone();
        let raster = config.qr_dir().join(format!("qr_{}.png", entry.key()));
        assert!(raster.exists());

        let page = send!(app, browser, form("/delete_qr/not-there", &[]));
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("QR code not found!"));
        assert_eq!(store.get_user("alice").unwrap().qr_codes.len(), 1);

        let uri = format!("/delete_qr/{}", entry.key());
        let page = send!(app, browser, form(&uri, &[]));
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("QR code deleted successfully!"));
        assert!(store.get_user("alice").unwrap().qr_codes.is_empty());
        assert!(!raster.exists());

        let page = send!(app, browser, get("/logout"));
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("Logged out successfully."));
        assert!(!page.body.contains("Logged in as"));
    }

    #[actix_rt::test]
    async fn url_encoded_text_post() {
        let dir = tempfile::tempdir().unwrap();
        let (config, state) = test_state(dir.path());
        let app = test_app!(config, state);
        let mut browser = Browser::default();

        let fields = [("text-url", "hello"), ("qr-name", "Plain")];
        let page = send!(app, browser, form("/", &fields));
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location, "/login");
        let page = send!(app, browser, get("/login"));
        assert!(page.body.contains("You need to log in to save QR codes!"));

        let creds = [("username", "carol"), ("password", "pw"), ("password2", "pw")];
        send!(app, browser, form("/register", &creds));
        send!(app, browser, form("/login", &[("username", "carol"), ("password", "pw")]));

        let page = send!(app, browser, form("/", &fields));
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location, "/");
        let store = JsonStore::new(&config.users_file);
        let entries = store.get_user("carol").unwrap().qr_codes;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Plain");
        assert_eq!(entries[0].source, None);

        let page = send!(app, browser, form("/", &[("qr-name", "Empty")]));
        assert_eq!(page.location, "/");
        let page = send!(app, browser, get("/"));
        assert!(page.body.contains("Please enter text or upload a file."));
        assert_eq!(store.get_user("carol").unwrap().qr_codes.len(), 1);
    }

    #[actix_rt::test]
    async fn upload_is_stored_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let (config, state) = test_state(dir.path());
        let app = test_app!(config, state);
        let mut browser = Browser::default();

        let creds = [("username", "bob"), ("password", "pw"), ("password2", "pw")];
        send!(app, browser, form("/register", &creds));
        send!(app, browser, form("/login", &[("username", "bob"), ("password", "pw")]));

        let upload = Some(("menu.txt", "soup of the day"));
        let page = send!(app, browser, multipart(&[("text-url", "")], upload));
        assert_eq!(page.location, "/");

        let store = JsonStore::new(&config.users_file);
        let entries = store.get_user("bob").unwrap().qr_codes;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Untitled QR");
        let source = entries[0].source.clone().unwrap();
        assert!(source.ends_with("_menu.txt"));

        let page = send!(app, browser, get(&format!("/{}", source)));
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.body, "soup of the day");

        let big = "b".repeat(300 * 1024);
        let page = send!(app, browser, multipart(&[], Some(("big.txt", big.as_str()))));
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location, "/");
        assert_eq!(store.get_user("bob").unwrap().qr_codes.len(), 2);
    }
}
