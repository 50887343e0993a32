use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use stplug::domain::ResourceId;
use stplug::error::StplugError;
use stplug::library::{InstallLocator, SteamLibrary};

fn write(path: &Utf8Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(path.as_std_path(), content).unwrap();
}

fn app_manifest(id: u32, name: &str, dir: &str) -> String {
    format!(
        "\"AppState\"\n{{\n\t\"appid\"\t\t\"{id}\"\n\t\"name\"\t\t\"{name}\"\n\t\"installdir\"\t\t\"{dir}\"\n}}\n"
    )
}

/// Two libraries: the Steam root itself and a second drive.
fn steam_tree() -> (tempfile::TempDir, Utf8PathBuf, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let steam = root.join("steam");
    let second = root.join("library2");
    write(
        &steam.join("config").join("libraryfolders.vdf"),
        &format!(
            "\"libraryfolders\"\n{{\n\t\"0\"\n\t{{\n\t\t\"path\"\t\t\"{steam}\"\n\t\t\"apps\"\n\t\t{{\n\t\t\t\"10\"\t\t\"1\"\n\t\t}}\n\t}}\n\t\"1\"\n\t{{\n\t\t\"path\"\t\t\"{second}\"\n\t\t\"apps\"\n\t\t{{\n\t\t}}\n\t}}\n}}\n"
        ),
    );
    write(
        &steam.join("steamapps").join("appmanifest_10.acf"),
        &app_manifest(10, "Ten", "Ten Game"),
    );
    std::fs::create_dir_all(steam.join("steamapps/common/Ten Game").as_std_path()).unwrap();
    write(
        &second.join("steamapps").join("appmanifest_20.acf"),
        &app_manifest(20, "Twenty", "Twenty"),
    );
    std::fs::create_dir_all(second.join("steamapps/common/Twenty").as_std_path()).unwrap();
    write(
        &second.join("steamapps").join("appmanifest_30.acf"),
        &app_manifest(30, "Thirty", "Missing"),
    );
    (temp, steam, second)
}

#[test]
fn install_path_resolves_listed_and_unlisted_apps() {
    let (_temp, steam, second) = steam_tree();
    let library = SteamLibrary::new(Some(steam.clone()));

    assert_eq!(
        library.install_path(ResourceId::new(10).unwrap()).unwrap(),
        steam.join("steamapps/common/Ten Game")
    );
    assert_eq!(
        library.install_path(ResourceId::new(20).unwrap()).unwrap(),
        second.join("steamapps/common/Twenty")
    );
    assert_matches!(
        library.install_path(ResourceId::new(30).unwrap()),
        Err(StplugError::InstallNotFound(_))
    );
    assert_matches!(
        library.install_path(ResourceId::new(40).unwrap()),
        Err(StplugError::InstallNotFound(_))
    );
}

#[test]
fn installed_apps_skip_missing_directories() {
    let (_temp, steam, _second) = steam_tree();
    let library = SteamLibrary::new(Some(steam));
    let apps = library.installed_apps().unwrap();
    let names = apps.iter().map(|app| app.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Ten", "Twenty"]);
}

#[test]
fn missing_steam_root_is_reported() {
    let library = SteamLibrary::new(None);
    assert_matches!(library.installed_apps(), Err(StplugError::InstallNotFound(_)));
}
