#[rocket::launch]
fn rocket() -> _ {
    codekata_api::rocket()
}
